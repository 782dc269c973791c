use anyhow::Context;
use sqlx::PgExecutor;

use super::repo_types::{Media, NewMedia};

pub async fn insert_media<'e, E: PgExecutor<'e>>(
    db: E,
    new: &NewMedia<'_>,
) -> anyhow::Result<Media> {
    let media = sqlx::query_as::<_, Media>(
        r#"
        INSERT INTO media (id, uploaded_by, object_key, file_name, content_type, size_bytes)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, uploaded_by, object_key, file_name, content_type, size_bytes,
                  is_public, created_at
        "#,
    )
    .bind(new.id)
    .bind(new.uploaded_by)
    .bind(new.object_key)
    .bind(new.file_name)
    .bind(new.content_type)
    .bind(new.size_bytes)
    .fetch_one(db)
    .await
    .context("insert media")?;
    Ok(media)
}

pub async fn find_media<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<Option<Media>> {
    let media = sqlx::query_as::<_, Media>(
        r#"
        SELECT id, uploaded_by, object_key, file_name, content_type, size_bytes,
               is_public, created_at
          FROM media
         WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await
    .context("find media")?;
    Ok(media)
}

/// Newest first.
pub async fn list_media<'e, E: PgExecutor<'e>>(
    db: E,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<Media>> {
    let items = sqlx::query_as::<_, Media>(
        r#"
        SELECT id, uploaded_by, object_key, file_name, content_type, size_bytes,
               is_public, created_at
          FROM media
         ORDER BY created_at DESC, id DESC
         LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await
    .context("list media")?;
    Ok(items)
}

pub async fn count_media<'e, E: PgExecutor<'e>>(db: E) -> anyhow::Result<i64> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
        .fetch_one(db)
        .await
        .context("count media")?;
    Ok(total)
}

pub async fn set_visibility<'e, E: PgExecutor<'e>>(
    db: E,
    id: &str,
    is_public: bool,
) -> anyhow::Result<Option<Media>> {
    let media = sqlx::query_as::<_, Media>(
        r#"
        UPDATE media SET is_public = $2
         WHERE id = $1
        RETURNING id, uploaded_by, object_key, file_name, content_type, size_bytes,
                  is_public, created_at
        "#,
    )
    .bind(id)
    .bind(is_public)
    .fetch_optional(db)
    .await
    .context("set media visibility")?;
    Ok(media)
}

pub async fn delete_media<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM media WHERE id = $1")
        .bind(id)
        .execute(db)
        .await
        .context("delete media")?;
    Ok(res.rows_affected() > 0)
}
