use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = String;

/// A physical row as it travels through the data plane and the change feeds.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalType {
    Text,
    Varchar,
    Integer,
    Bigint,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl LogicalType {
    /// Postgres type used when the column is created or altered
    pub fn sql_type(&self) -> &'static str {
        match self {
            LogicalType::Text => "TEXT",
            LogicalType::Varchar => "VARCHAR(255)",
            LogicalType::Integer => "INTEGER",
            LogicalType::Bigint => "BIGINT",
            LogicalType::Decimal => "NUMERIC",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Date => "DATE",
            LogicalType::Timestamp => "TIMESTAMPTZ",
            LogicalType::Uuid => "UUID",
            LogicalType::Json => "JSONB",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Bigint)
    }
}

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Allocate an immutable physical name such as `t_3f9c0a1b2c4d`.
pub fn generate_internal_name(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &simple[..12])
}

/// Physical identifiers are quoted in DDL, but we still only accept a
/// conservative alphabet so they survive every driver and feed unchanged.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
