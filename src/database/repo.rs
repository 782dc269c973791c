use anyhow::Context;
use serde_json::Value;
use sqlx::{PgExecutor, Row};

use super::repo_types::{ColumnInfo, TableInfo};

/// Base tables of the `public` schema, migrations bookkeeping excluded.
pub async fn list_tables<'e, E: PgExecutor<'e>>(db: E) -> anyhow::Result<Vec<TableInfo>> {
    let tables = sqlx::query_as::<_, TableInfo>(
        r#"
        SELECT t.table_name::text AS name,
               GREATEST(COALESCE(c.reltuples, 0), 0)::bigint AS estimated_rows
          FROM information_schema.tables t
          LEFT JOIN pg_catalog.pg_class c
                 ON c.relname = t.table_name
                AND c.relnamespace = 'public'::regnamespace
         WHERE t.table_schema = 'public'
           AND t.table_type = 'BASE TABLE'
           AND t.table_name <> '_sqlx_migrations'
         ORDER BY t.table_name
        "#,
    )
    .fetch_all(db)
    .await
    .context("list tables")?;
    Ok(tables)
}

pub async fn list_columns<'e, E: PgExecutor<'e>>(
    db: E,
    table: &str,
) -> anyhow::Result<Vec<ColumnInfo>> {
    let columns = sqlx::query_as::<_, ColumnInfo>(
        r#"
        SELECT column_name::text AS name,
               data_type::text AS data_type,
               (is_nullable = 'YES') AS is_nullable
          FROM information_schema.columns
         WHERE table_schema = 'public' AND table_name = $1
         ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(db)
    .await
    .context("list columns")?;
    Ok(columns)
}

/// Runs a statement built by `services::rows_sql`; `$1` is the limit, `$2` the offset.
pub async fn fetch_rows<'e, E: PgExecutor<'e>>(
    db: E,
    sql: &str,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(db)
        .await
        .context("fetch table rows")?;
    rows.iter()
        .map(|r| r.try_get::<Value, _>("row").context("decode row"))
        .collect()
}

pub async fn count_rows<'e, E: PgExecutor<'e>>(db: E, sql: &str) -> anyhow::Result<i64> {
    let total: i64 = sqlx::query_scalar(sql)
        .fetch_one(db)
        .await
        .context("count table rows")?;
    Ok(total)
}
