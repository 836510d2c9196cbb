//! Access/refresh token lifecycle.
//!
//! Each user holds at most one live refresh token. Issuing a pair overwrites
//! it, rotation consumes it, revocation clears it.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::jwt::JwtKeys;
use crate::{
    error::{AppError, AppResult},
    users::{repo::UserStore, repo_types::User},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

fn sign_pair(keys: &JwtKeys, user: &User) -> AppResult<TokenPair> {
    Ok(TokenPair {
        access_token: keys.sign_access(user)?,
        refresh_token: keys.sign_refresh(user.id)?,
    })
}

/// Signs a fresh pair and stores its refresh token, ending any previous session.
pub async fn issue_pair(store: &dyn UserStore, keys: &JwtKeys, user: &User) -> AppResult<TokenPair> {
    let pair = sign_pair(keys, user)?;
    store
        .set_refresh_token(user.id, Some(&pair.refresh_token))
        .await?;
    Ok(pair)
}

/// Exchanges a refresh token for a new pair. The presented token is consumed.
pub async fn rotate(
    store: &dyn UserStore,
    keys: &JwtKeys,
    presented: Option<&str>,
) -> AppResult<TokenPair> {
    let presented = presented
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Unauthorized request".into()))?;

    let claims = keys.verify_refresh(presented).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        AppError::TokenInvalid
    })?;

    let user = store
        .find_by_id(claims.sub)
        .await?
        .ok_or(AppError::TokenInvalid)?;

    if user.refresh_token.as_deref() != Some(presented) {
        warn!(user_id = %user.id, "stale refresh token presented");
        return Err(AppError::SessionMismatch);
    }

    let pair = sign_pair(keys, &user)?;
    // Conditional write: a concurrent rotation that got here first wins.
    let swapped = store
        .swap_refresh_token(user.id, presented, &pair.refresh_token)
        .await?;
    if !swapped {
        warn!(user_id = %user.id, "refresh token rotated concurrently");
        return Err(AppError::SessionMismatch);
    }

    info!(user_id = %user.id, "refresh token rotated");
    Ok(pair)
}

/// Clears the stored refresh token. Outstanding refresh tokens stop working.
pub async fn revoke(store: &dyn UserStore, user_id: Uuid) -> AppResult<()> {
    store.set_refresh_token(user_id, None).await?;
    info!(%user_id, "session revoked");
    Ok(())
}
