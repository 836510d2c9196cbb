use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;

use super::{cookies, jwt::JwtKeys};
use crate::{error::AppError, state::AppState, users::repo_types::PublicUser};

/// The authenticated caller, resolved from the access token.
///
/// The token comes from the `accessToken` cookie, or failing that from an
/// `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub PublicUser);

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = cookies::read(&jar, cookies::ACCESS_COOKIE)
            .or_else(|| bearer_token(parts))
            .ok_or_else(|| AppError::Unauthorized("Unauthorized request".into()))?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify_access(&token).map_err(|e| {
            warn!(error = %e, "invalid or expired access token");
            AppError::TokenInvalid
        })?;

        let user = state
            .users
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid access token".into()))?;

        Ok(CurrentUser(PublicUser::from(user)))
    }
}
