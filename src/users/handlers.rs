use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        Path, State,
    },
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        extractors::CurrentUser,
        handlers::MAX_UPLOAD_BYTES,
        password::{hash_password, verify_password},
    },
    error::{AppError, AppResult},
    media::services::{ImageKind, UploadForm},
    response::ApiResponse,
    state::AppState,
    users::{
        dto::{ChangePasswordRequest, UpdateAccountRequest},
        repo_types::{ChannelProfile, PublicUser, WatchedVideo},
        services::{
            email_taken_by_other, is_valid_email, non_blank, normalize_email, normalize_username,
            replace_image,
        },
    },
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/change-password", post(change_password))
        .route("/current-user", get(current_user))
        .route("/update-account", patch(update_account))
        .route(
            "/update-avatar",
            patch(update_avatar).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/update-cover",
            patch(update_cover).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/c/:username", get(channel_profile))
        .route("/history", get(watch_history))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.0.id))]
pub async fn change_password(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let Json(payload) = payload?;
    let (Some(old_password), Some(new_password)) = (
        payload.old_password.filter(|p| !p.is_empty()),
        payload.new_password.filter(|p| !p.trim().is_empty()),
    ) else {
        return Err(AppError::BadRequest(
            "Old and new password are required".into(),
        ));
    };

    let stored = state
        .users
        .find_by_id(user.0.id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid access token".into()))?;

    if !verify_password(&old_password, &stored.password_hash)? {
        warn!(user_id = %stored.id, "change password with wrong old password");
        return Err(AppError::BadRequest("Invalid old password".into()));
    }

    state
        .users
        .update_password(stored.id, &hash_password(&new_password)?)
        .await?;
    info!(user_id = %stored.id, "password changed");
    Ok(ApiResponse::ok(json!({}), "Password changed successfully"))
}

#[instrument(skip(user), fields(user_id = %user.0.id))]
pub async fn current_user(user: CurrentUser) -> AppResult<ApiResponse<PublicUser>> {
    Ok(ApiResponse::ok(user.0, "User fetched successfully"))
}

#[instrument(skip(state, user, payload), fields(user_id = %user.0.id))]
pub async fn update_account(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<UpdateAccountRequest>, JsonRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let Json(payload) = payload?;
    let full_name = non_blank(payload.full_name.as_deref());
    let email = non_blank(payload.email.as_deref()).map(normalize_email);
    if full_name.is_none() && email.is_none() {
        return Err(AppError::BadRequest(
            "Full name or email is required".into(),
        ));
    }

    if let Some(email) = email.as_deref() {
        if !is_valid_email(email) {
            return Err(AppError::BadRequest("Invalid email".into()));
        }
        if email_taken_by_other(state.users.as_ref(), email, user.0.id).await? {
            warn!(user_id = %user.0.id, "email already in use");
            return Err(AppError::Conflict("Email already in use".into()));
        }
    }

    let updated = state
        .users
        .update_account(user.0.id, full_name, email.as_deref())
        .await
        .map_err(|e| AppError::from_store(e, "Email already in use"))?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(ApiResponse::ok(
        updated.into(),
        "Account details updated successfully",
    ))
}

async fn update_image(
    state: &AppState,
    user: &PublicUser,
    multipart: Result<Multipart, MultipartRejection>,
    kind: ImageKind,
    field: &str,
) -> AppResult<PublicUser> {
    let mut form = UploadForm::read(multipart?).await?;
    replace_image(
        state.users.as_ref(),
        state.storage.as_ref(),
        user,
        kind,
        form.take_file(field),
    )
    .await
}

#[instrument(skip(state, user, multipart), fields(user_id = %user.0.id))]
pub async fn update_avatar(
    State(state): State<AppState>,
    user: CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let updated = update_image(&state, &user.0, multipart, ImageKind::Avatar, "avatar").await?;
    Ok(ApiResponse::ok(updated, "Avatar updated successfully"))
}

#[instrument(skip(state, user, multipart), fields(user_id = %user.0.id))]
pub async fn update_cover(
    State(state): State<AppState>,
    user: CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let updated = update_image(&state, &user.0, multipart, ImageKind::Cover, "coverImage").await?;
    Ok(ApiResponse::ok(updated, "Cover image updated successfully"))
}

#[instrument(skip(state, user), fields(user_id = %user.0.id))]
pub async fn channel_profile(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(username): Path<String>,
) -> AppResult<ApiResponse<ChannelProfile>> {
    if username.trim().is_empty() {
        return Err(AppError::BadRequest("Username is missing".into()));
    }

    let profile = state
        .users
        .channel_profile(&normalize_username(&username), user.0.id)
        .await?
        .ok_or_else(|| AppError::NotFound("Channel does not exist".into()))?;

    Ok(ApiResponse::ok(profile, "User channel fetched successfully"))
}

#[instrument(skip(state, user), fields(user_id = %user.0.id))]
pub async fn watch_history(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<ApiResponse<Vec<WatchedVideo>>> {
    let history = state.users.watch_history(user.0.id).await?;
    Ok(ApiResponse::ok(history, "Watch history fetched successfully"))
}
