use crate::state::AppState;
use axum::Router;

mod claims;
pub mod cookies;
mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod password;
pub mod session;

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
