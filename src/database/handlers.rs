use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use tracing::instrument;

use super::{
    dto::{RowsQuery, TableRows},
    repo_types::TableInfo,
    services,
};
use crate::{auth::extractors::AdminUser, error::ApiResult, state::AppState};

pub fn database_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/database/tables", get(list_tables))
        .route("/admin/database/tables/:table", get(table_rows))
}

#[instrument(skip(state, _admin))]
pub async fn list_tables(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<Vec<TableInfo>>> {
    Ok(Json(services::list_tables(&state).await?))
}

#[instrument(skip(state, _admin))]
pub async fn table_rows(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(table): Path<String>,
    Query(q): Query<RowsQuery>,
) -> ApiResult<Json<TableRows>> {
    Ok(Json(services::browse(&state, &table, q).await?))
}
