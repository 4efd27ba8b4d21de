//! Row decoding into JSON maps.
//!
//! Column values are classified by declared type name first, then decoded
//! with the backend's native types. Undecodable values become `null`.

use crate::models::{DatabaseType, JsonRow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Json,
    Temporal,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    // SQLite NUMERIC affinity stores reals; elsewhere keep exact text
    if lower == "numeric" && db == DatabaseType::SQLite {
        return TypeCategory::Float;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.starts_with("timestamp")
        || lower == "datetime"
        || lower == "date"
        || lower == "time"
        || lower == "timetz"
    {
        return TypeCategory::Temporal;
    }
    TypeCategory::Text
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn binary_value(bytes: Vec<u8>) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Decode a date/time column as an ISO 8601 string.
///
/// Zoned timestamps render as RFC 3339 in UTC; naive values keep no offset.
fn temporal_value<'r, R>(row: &'r R, idx: usize) -> Option<JsonValue>
where
    R: Row,
    usize: ColumnIndex<R>,
    DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
    NaiveDateTime: Decode<'r, R::Database> + Type<R::Database>,
    NaiveDate: Decode<'r, R::Database> + Type<R::Database>,
    NaiveTime: Decode<'r, R::Database> + Type<R::Database>,
{
    let text = if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
        v.map(|t| t.to_rfc3339())
    } else if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        v.map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
    } else if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
        v.map(|d| d.to_string())
    } else {
        row.try_get::<Option<NaiveTime>, _>(idx)
            .ok()
            .flatten()
            .map(|t| t.to_string())
    };
    text.map(JsonValue::String)
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let value = match categorize_type(col.type_info().name(), DatabaseType::MySQL) {
                    TypeCategory::Integer => self
                        .try_get::<Option<i64>, _>(idx)
                        .map(|v| v.map(JsonValue::from))
                        .or_else(|_| {
                            self.try_get::<Option<u64>, _>(idx)
                                .map(|v| v.map(JsonValue::from))
                        })
                        .ok()
                        .flatten(),
                    TypeCategory::Float => self
                        .try_get::<Option<f64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(float_value),
                    TypeCategory::Boolean => self
                        .try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool),
                    TypeCategory::Binary => self
                        .try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(binary_value),
                    TypeCategory::Json => self
                        .try_get::<Option<JsonValue>, _>(idx)
                        .ok()
                        .flatten(),
                    TypeCategory::Temporal => temporal_value(self, idx),
                    TypeCategory::Text => self
                        .try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::String),
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let value = match categorize_type(col.type_info().name(), DatabaseType::PostgreSQL)
                {
                    TypeCategory::Integer => self
                        .try_get::<Option<i64>, _>(idx)
                        .map(|v| v.map(JsonValue::from))
                        .or_else(|_| {
                            self.try_get::<Option<i32>, _>(idx)
                                .map(|v| v.map(JsonValue::from))
                        })
                        .or_else(|_| {
                            self.try_get::<Option<i16>, _>(idx)
                                .map(|v| v.map(JsonValue::from))
                        })
                        .ok()
                        .flatten(),
                    TypeCategory::Float => self
                        .try_get::<Option<f64>, _>(idx)
                        .map(|v| v.map(float_value))
                        .or_else(|_| {
                            self.try_get::<Option<f32>, _>(idx)
                                .map(|v| v.map(|f| float_value(f.into())))
                        })
                        .ok()
                        .flatten(),
                    TypeCategory::Boolean => self
                        .try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool),
                    TypeCategory::Binary => self
                        .try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(binary_value),
                    TypeCategory::Json => self
                        .try_get::<Option<JsonValue>, _>(idx)
                        .ok()
                        .flatten(),
                    TypeCategory::Temporal => temporal_value(self, idx),
                    TypeCategory::Text => self
                        .try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::String),
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                // Expression columns report "NULL" as their type; decode by value instead.
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, DatabaseType::SQLite) {
                    TypeCategory::Integer => self
                        .try_get::<Option<i64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::from),
                    TypeCategory::Float => self
                        .try_get::<Option<f64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(float_value),
                    TypeCategory::Boolean => self
                        .try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool),
                    TypeCategory::Binary => self
                        .try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(binary_value),
                    // stored as TEXT, REAL or INTEGER depending on the writer
                    TypeCategory::Json | TypeCategory::Temporal | TypeCategory::Text => {
                        sqlite_dynamic(self, idx)
                    }
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

/// Decode a SQLite value whose declared type says little about its storage class.
fn sqlite_dynamic(row: &SqliteRow, idx: usize) -> Option<JsonValue> {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return Some(JsonValue::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return Some(float_value(v));
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return Some(JsonValue::String(v));
    }
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(binary_value)
}
