use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header::LOCATION, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch},
    Json, Router,
};
use tracing::{instrument, warn};

use super::{
    dto::{MediaView, VisibilityRequest},
    services::{self, UploadItem, MAX_UPLOAD_BYTES},
};
use crate::{
    auth::extractors::AdminUser,
    error::{ApiError, ApiResult},
    pagination::{Page, PageParams},
    state::AppState,
};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/media",
            get(list_media)
                .post(upload_media)
                // multipart framing on top of the file itself
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024)),
        )
        .route("/admin/media/:id/visibility", patch(set_visibility))
        .route("/admin/media/:id", delete(delete_media))
}

pub fn public_routes() -> Router<AppState> {
    Router::new().route("/media/:id", get(public_media))
}

#[instrument(skip(state, _admin))]
pub async fn list_media(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(p): Query<PageParams>,
) -> ApiResult<Json<Page<MediaView>>> {
    Ok(Json(services::list(&state, p).await?))
}

/// POST /admin/media (multipart, field `file`)
#[instrument(skip(state, admin, mp))]
pub async fn upload_media(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    mut mp: Multipart,
) -> ApiResult<(StatusCode, Json<MediaView>)> {
    let mut item = None;
    while let Some(field) = mp.next_field().await.map_err(|e| {
        warn!(error = %e, "bad multipart body");
        ApiError::bad_request("Invalid multipart body")
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "upload".into());
        let content_type = field
            .content_type()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        let body = field
            .bytes()
            .await
            .map_err(|_| ApiError::bad_request("File is larger than 25 MB or truncated"))?;
        item = Some(UploadItem {
            file_name,
            content_type,
            body,
        });
        break;
    }
    let item = item.ok_or_else(|| ApiError::bad_request("file is required"))?;
    let media = services::upload(&state, admin.id(), item).await?;
    Ok((StatusCode::CREATED, Json(media)))
}

#[instrument(skip(state, _admin))]
pub async fn set_visibility(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<VisibilityRequest>,
) -> ApiResult<Json<MediaView>> {
    Ok(Json(services::set_visibility(&state, &id, payload.is_public).await?))
}

#[instrument(skip(state, _admin))]
pub async fn delete_media(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    services::delete(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 302 to a presigned URL of a public item.
#[instrument(skip(state))]
pub async fn public_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let url = services::public_url(&state, &id).await?;
    Ok((StatusCode::FOUND, [(LOCATION, url)]).into_response())
}
