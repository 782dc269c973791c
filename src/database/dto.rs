use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::repo_types::ColumnInfo;

#[derive(Debug, Default, Deserialize)]
pub struct RowsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TableRows {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Value>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}
