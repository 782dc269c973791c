use crate::state::AppState;
use axum::Router;

pub mod handlers;
pub mod providers;
pub mod services;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::oauth_routes())
}
