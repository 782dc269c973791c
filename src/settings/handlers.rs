use axum::{extract::State, routing::get, Json, Router};
use tracing::instrument;

use super::dto::SettingsView;
use crate::{auth::extractors::AdminUser, state::AppState};

pub fn settings_routes() -> Router<AppState> {
    Router::new().route("/admin/settings", get(settings))
}

#[instrument(skip_all)]
pub async fn settings(State(state): State<AppState>, _admin: AdminUser) -> Json<SettingsView> {
    Json(SettingsView::from_config(&state.config, state.mailer.kind()))
}
