use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, FromRef,
        Multipart, State,
    },
    routing::post,
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        cookies,
        dto::{LoginRequest, LoginResponse, RefreshRequest},
        extractors::CurrentUser,
        jwt::JwtKeys,
        password::verify_password,
        session::{self, TokenPair},
    },
    error::{AppError, AppResult},
    media::services::UploadForm,
    response::ApiResponse,
    state::AppState,
    users::{
        repo_types::PublicUser,
        services::{non_blank, normalize_email, normalize_username, register_user, Registration},
    },
};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024; // 10MB

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/register",
            post(register).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh_token))
}

#[instrument(skip(state, multipart))]
pub async fn register(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let mut form = UploadForm::read(multipart?).await?;
    let registration = Registration {
        full_name: form.field("fullname").or(form.field("fullName")).map(str::to_string),
        email: form.field("email").map(str::to_string),
        username: form.field("username").map(str::to_string),
        password: form.field("password").map(str::to_string),
        avatar: form.take_file("avatar"),
        cover_image: form.take_file("coverImage"),
    };

    let user = register_user(state.users.as_ref(), state.storage.as_ref(), registration).await?;
    Ok(ApiResponse::created(user, "User registered successfully"))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<(CookieJar, ApiResponse<LoginResponse>)> {
    let Json(payload) = payload?;
    let username = non_blank(payload.username.as_deref()).map(normalize_username);
    let email = non_blank(payload.email.as_deref()).map(normalize_email);
    if username.is_none() && email.is_none() {
        return Err(AppError::BadRequest("Username or email is required".into()));
    }

    let user = state
        .users
        .find_by_username_or_email(username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound("User does not exist".into()))?;

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized("Invalid user credentials".into()));
    }

    let keys = JwtKeys::from_ref(&state);
    let pair = session::issue_pair(state.users.as_ref(), &keys, &user).await?;
    info!(user_id = %user.id, "user logged in");

    let jar = cookies::with_tokens(jar, &pair, state.config.cookie_secure);
    let TokenPair {
        access_token,
        refresh_token,
    } = pair;
    Ok((
        jar,
        ApiResponse::ok(
            LoginResponse {
                user: user.into(),
                access_token,
                refresh_token,
            },
            "User logged in successfully",
        ),
    ))
}

#[instrument(skip(state, jar, user), fields(user_id = %user.0.id))]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    user: CurrentUser,
) -> AppResult<(CookieJar, ApiResponse<serde_json::Value>)> {
    session::revoke(state.users.as_ref(), user.0.id).await?;
    Ok((
        cookies::without_tokens(jar),
        ApiResponse::ok(json!({}), "User logged out"),
    ))
}

#[instrument(skip(state, jar, payload))]
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Option<Json<RefreshRequest>>,
) -> AppResult<(CookieJar, ApiResponse<TokenPair>)> {
    let presented = cookies::read(&jar, cookies::REFRESH_COOKIE)
        .or_else(|| payload.and_then(|Json(body)| body.refresh_token));

    let keys = JwtKeys::from_ref(&state);
    let pair = session::rotate(state.users.as_ref(), &keys, presented.as_deref()).await?;

    let jar = cookies::with_tokens(jar, &pair, state.config.cookie_secure);
    Ok((jar, ApiResponse::ok(pair, "Access token refreshed")))
}
