use serde_json::Value;
use tracing::debug;

use super::{
    dto::{RowsQuery, TableRows},
    repo,
    repo_types::{ColumnInfo, TableInfo},
};
use crate::{
    error::{ApiError, ApiResult},
    pagination::PageParams,
    state::AppState,
};

/// Columns whose values never leave the server.
pub const REDACTED_COLUMNS: &[&str] = &["password_hash", "token_hash"];
pub const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// `asc`/`desc` in any case; absent means ascending.
    pub fn parse(raw: Option<&str>) -> ApiResult<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("asc") => Ok(Self::Asc),
            Some("desc") => Ok(Self::Desc),
            Some(other) => Err(ApiError::bad_request(format!("Invalid sort order: {}", other))),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

pub fn resolve_table<'a>(tables: &'a [TableInfo], name: &str) -> ApiResult<&'a TableInfo> {
    tables
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| ApiError::not_found("Table not found"))
}

/// Sort column must be one of the table's own columns; defaults to the first.
pub fn resolve_sort<'a>(columns: &'a [ColumnInfo], sort: Option<&str>) -> ApiResult<&'a str> {
    match sort.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => columns
            .iter()
            .find(|c| c.name == s)
            .map(|c| c.name.as_str())
            .ok_or_else(|| ApiError::bad_request(format!("Unknown sort column: {}", s))),
        None => columns
            .first()
            .map(|c| c.name.as_str())
            .ok_or_else(|| ApiError::bad_request("Table has no columns")),
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Only call with identifiers that passed `resolve_table` and `resolve_sort`.
pub fn rows_sql(table: &str, sort: &str, order: SortOrder) -> String {
    format!(
        "SELECT row_to_json(t) AS row FROM {} t ORDER BY t.{} {} LIMIT $1 OFFSET $2",
        quote_ident(table),
        quote_ident(sort),
        order.sql()
    )
}

pub fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

pub fn redact(mut row: Value) -> Value {
    if let Value::Object(map) = &mut row {
        for col in REDACTED_COLUMNS {
            if let Some(v) = map.get_mut(*col) {
                if !v.is_null() {
                    *v = Value::String(REDACTED.to_string());
                }
            }
        }
    }
    row
}

pub async fn list_tables(state: &AppState) -> ApiResult<Vec<TableInfo>> {
    Ok(repo::list_tables(&state.db).await?)
}

pub async fn browse(state: &AppState, table: &str, q: RowsQuery) -> ApiResult<TableRows> {
    let order = SortOrder::parse(q.order.as_deref())?;
    let tables = repo::list_tables(&state.db).await?;
    let table = resolve_table(&tables, table)?.name.clone();
    let columns = repo::list_columns(&state.db, &table).await?;
    let sort = resolve_sort(&columns, q.sort.as_deref())?;

    let params = PageParams {
        page: q.page,
        page_size: q.page_size,
    };
    let sql = rows_sql(&table, sort, order);
    debug!(%table, %sort, ?order, page = params.page(), "browse table");
    let rows = repo::fetch_rows(&state.db, &sql, params.limit(), params.offset())
        .await?
        .into_iter()
        .map(redact)
        .collect();
    let total = repo::count_rows(&state.db, &count_sql(&table)).await?;

    Ok(TableRows {
        table,
        columns,
        rows,
        page: params.page(),
        page_size: params.limit(),
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::PgPool;

    fn cols(names: &[&str]) -> Vec<ColumnInfo> {
        names
            .iter()
            .map(|n| ColumnInfo {
                name: n.to_string(),
                data_type: "text".into(),
                is_nullable: true,
            })
            .collect()
    }

    #[test]
    fn sort_defaults_to_first_column() {
        let c = cols(&["id", "email"]);
        assert_eq!(resolve_sort(&c, None).unwrap(), "id");
        assert_eq!(resolve_sort(&c, Some("  ")).unwrap(), "id");
        assert_eq!(resolve_sort(&c, Some("email")).unwrap(), "email");
    }

    #[test]
    fn unknown_sort_column_is_rejected() {
        let c = cols(&["id", "email"]);
        let err = resolve_sort(&c, Some("email; DROP TABLE users")).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(matches!(resolve_sort(&[], None), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn order_is_case_insensitive_and_strict() {
        assert_eq!(SortOrder::parse(None).unwrap(), SortOrder::Asc);
        assert_eq!(SortOrder::parse(Some("DESC")).unwrap(), SortOrder::Desc);
        assert_eq!(SortOrder::parse(Some("Asc")).unwrap(), SortOrder::Asc);
        assert!(SortOrder::parse(Some("sideways")).is_err());
        assert!(SortOrder::parse(Some("asc;--")).is_err());
    }

    #[test]
    fn only_listed_tables_resolve() {
        let tables = vec![TableInfo {
            name: "users".into(),
            estimated_rows: 3,
        }];
        assert_eq!(resolve_table(&tables, "users").unwrap().name, "users");
        let err = resolve_table(&tables, "pg_authid").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            rows_sql("users", "created_at", SortOrder::Desc),
            "SELECT row_to_json(t) AS row FROM \"users\" t \
             ORDER BY t.\"created_at\" DESC LIMIT $1 OFFSET $2"
        );
        assert_eq!(count_sql("media"), "SELECT COUNT(*) FROM \"media\"");
    }

    #[test]
    fn secrets_are_redacted() {
        let row = redact(json!({
            "id": "1",
            "password_hash": "$argon2id$...",
            "token_hash": null,
        }));
        assert_eq!(row["password_hash"], "[redacted]");
        assert_eq!(row["token_hash"], Value::Null);
        assert_eq!(row["id"], "1");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn rows_come_back_in_sort_order(pool: PgPool) {
        let state = AppState::fake_with_pool(pool);
        for name in ["editor", "viewer", "billing"] {
            crate::users::repo::insert_role(&state.db, name)
                .await
                .unwrap();
        }
        let q = RowsQuery {
            sort: Some("name".into()),
            order: Some("desc".into()),
            page_size: Some(2),
            ..Default::default()
        };
        let first = browse(&state, "roles", q).await.unwrap();
        assert_eq!(first.total, 5);
        let names: Vec<&str> = first.rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["viewer", "user"]);

        let q = RowsQuery {
            sort: Some("name".into()),
            page: Some(2),
            page_size: Some(2),
            ..Default::default()
        };
        let second = browse(&state, "roles", q).await.unwrap();
        let names: Vec<&str> = second.rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["editor", "user"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn hashes_are_redacted_when_browsing(pool: PgPool) {
        let state = AppState::fake_with_pool(pool);
        crate::auth::repo::insert_token(
            &state.db,
            "ann@example.com",
            "digest",
            crate::auth::repo::TokenPurpose::MagicLink,
        )
        .await
        .unwrap();
        let page = browse(&state, "verification_tokens", RowsQuery::default())
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0]["token_hash"], REDACTED);
        assert_eq!(page.rows[0]["email"], "ann@example.com");
    }
}
