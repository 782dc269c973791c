use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TableInfo {
    pub name: String,
    /// Planner estimate from `pg_class.reltuples`; 0 before the first ANALYZE.
    pub estimated_rows: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}
