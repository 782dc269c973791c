use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::repo_types::Media;

#[derive(Debug, Serialize)]
pub struct MediaView {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub is_public: bool,
    pub uploaded_by: Option<String>,
    /// Presigned, short-lived.
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl MediaView {
    pub fn new(m: Media, url: String) -> Self {
        Self {
            id: m.id,
            file_name: m.file_name,
            content_type: m.content_type,
            size_bytes: m.size_bytes,
            is_public: m.is_public,
            uploaded_by: m.uploaded_by,
            url,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub is_public: bool,
}
