use anyhow::Context;
use bytes::Bytes;
use tracing::{info, warn};

use super::{
    dto::MediaView,
    repo,
    repo_types::{Media, NewMedia},
};
use crate::{
    error::{ApiError, ApiResult},
    ids::{is_valid_id, new_id},
    pagination::{Page, PageParams},
    state::AppState,
    storage::{StorageClient, StorageError},
};

pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
pub const PRESIGN_TTL_SECS: u64 = 30 * 60;

pub struct UploadItem {
    pub file_name: String,
    pub content_type: String,
    pub body: Bytes,
}

pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/svg+xml" => Some("svg"),
        "image/heic" => Some("heic"),
        "application/pdf" => Some("pdf"),
        "video/mp4" => Some("mp4"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

/// Extension of the uploaded file name when it is short and alphanumeric.
fn ext_from_name(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}

/// `media/<id>.<ext>`; the extension comes from the MIME type, then the file name.
pub fn object_key(id: &str, content_type: &str, file_name: &str) -> String {
    let ext = ext_from_mime(content_type)
        .map(String::from)
        .or_else(|| ext_from_name(file_name))
        .unwrap_or_else(|| "bin".to_string());
    format!("media/{}.{}", id, ext)
}

/// Deletes an object; one that is already gone counts as deleted.
pub async fn remove_object(storage: &dyn StorageClient, key: &str) -> anyhow::Result<()> {
    match storage.delete_object(key).await {
        Ok(()) => Ok(()),
        Err(StorageError::NotFound(k)) => {
            warn!(key = %k, "object already missing from storage");
            Ok(())
        }
        Err(StorageError::Other(e)) => Err(e),
    }
}

async fn view(state: &AppState, m: Media) -> ApiResult<MediaView> {
    let url = state
        .storage
        .presign_get(&m.object_key, PRESIGN_TTL_SECS)
        .await
        .with_context(|| format!("presign url for {}", m.object_key))?;
    Ok(MediaView::new(m, url))
}

pub async fn upload(state: &AppState, uploader_id: &str, item: UploadItem) -> ApiResult<MediaView> {
    if item.body.is_empty() {
        return Err(ApiError::bad_request("File is empty"));
    }
    if item.body.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::bad_request("File is larger than 25 MB"));
    }
    let id = new_id();
    let key = object_key(&id, &item.content_type, &item.file_name);
    let size = item.body.len() as i64;

    state
        .storage
        .put_object(&key, item.body, &item.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;

    let inserted = repo::insert_media(
        &state.db,
        &NewMedia {
            id: &id,
            uploaded_by: uploader_id,
            object_key: &key,
            file_name: &item.file_name,
            content_type: &item.content_type,
            size_bytes: size,
        },
    )
    .await;
    let media = match inserted {
        Ok(m) => m,
        Err(e) => {
            if let Err(cleanup) = remove_object(state.storage.as_ref(), &key).await {
                warn!(error = %cleanup, %key, "orphaned object after failed insert");
            }
            return Err(e.into());
        }
    };

    info!(media_id = %media.id, %key, size, uploader_id = %uploader_id, "media uploaded");
    view(state, media).await
}

pub async fn list(state: &AppState, params: PageParams) -> ApiResult<Page<MediaView>> {
    let items = repo::list_media(&state.db, params.limit(), params.offset()).await?;
    let total = repo::count_media(&state.db).await?;
    let mut out = Vec::with_capacity(items.len());
    for m in items {
        out.push(view(state, m).await?);
    }
    Ok(Page::new(out, &params, total))
}

pub async fn set_visibility(state: &AppState, id: &str, is_public: bool) -> ApiResult<MediaView> {
    if !is_valid_id(id) {
        return Err(ApiError::not_found("Media not found"));
    }
    let media = repo::set_visibility(&state.db, id, is_public)
        .await?
        .ok_or_else(|| ApiError::not_found("Media not found"))?;
    info!(media_id = %id, is_public, "media visibility changed");
    view(state, media).await
}

pub async fn delete(state: &AppState, id: &str) -> ApiResult<()> {
    if !is_valid_id(id) {
        return Err(ApiError::not_found("Media not found"));
    }
    let media = repo::find_media(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Media not found"))?;
    remove_object(state.storage.as_ref(), &media.object_key).await?;
    repo::delete_media(&state.db, id).await?;
    info!(media_id = %id, key = %media.object_key, "media deleted");
    Ok(())
}

/// Presigned URL of a public item; private and unknown ids are both 404.
pub async fn public_url(state: &AppState, id: &str) -> ApiResult<String> {
    if !is_valid_id(id) {
        return Err(ApiError::not_found("Media not found"));
    }
    let media = repo::find_media(&state.db, id)
        .await?
        .filter(|m| m.is_public)
        .ok_or_else(|| ApiError::not_found("Media not found"))?;
    let url = state
        .storage
        .presign_get(&media.object_key, PRESIGN_TTL_SECS)
        .await
        .context("presign public media")?;
    Ok(url)
}
