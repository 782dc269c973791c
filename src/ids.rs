use ulid::Ulid;

/// New primary key. Rows are keyed by ULID strings so ids sort by creation time.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

pub fn is_valid_id(raw: &str) -> bool {
    raw.len() == 26 && Ulid::from_string(raw).is_ok()
}
