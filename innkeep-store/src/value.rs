//! Cell values, column types and the codec between engine cells and the
//! JSON documents exposed by repositories.
//!
//! Storage-level encoding:
//! - `Boolean` columns hold `Integer(0)` / `Integer(1)`
//! - `Timestamp` columns hold RFC 3339 UTC text with microsecond precision
//! - `Json` columns hold the serialized document as text

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// A single stored value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(value) => Some(value),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Cell::Null => 0,
            Cell::Integer(_) | Cell::Real(_) => 1,
            Cell::Text(_) => 2,
        }
    }

    pub fn storage_name(&self) -> &'static str {
        match self {
            Cell::Null => "null",
            Cell::Integer(_) => "integer",
            Cell::Real(_) => "real",
            Cell::Text(_) => "text",
        }
    }
}

// Numeric cells compare by value across Integer/Real so that filters and
// indexes agree with SQL numeric affinity.
impl Ord for Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Cell::Integer(a), Cell::Integer(b)) => a.cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Cell::Integer(a), Cell::Real(b)) => (*a as f64).total_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Cell::Real(a), Cell::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Cell::Real(a), Cell::Real(b)) => a.total_cmp(b),
            (Cell::Text(a), Cell::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cell {}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Real(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Integer(i64::from(value))
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Null, Into::into)
    }
}

/// Primary key of a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordId {
    Integer(i64),
    Text(String),
}

impl RecordId {
    pub fn to_cell(&self) -> Cell {
        match self {
            RecordId::Integer(value) => Cell::Integer(*value),
            RecordId::Text(value) => Cell::Text(value.clone()),
        }
    }

    pub fn from_cell(cell: &Cell) -> StoreResult<Self> {
        match cell {
            Cell::Integer(value) => Ok(RecordId::Integer(*value)),
            Cell::Text(value) => Ok(RecordId::Text(value.clone())),
            other => Err(StoreError::ConstraintViolation(format!(
                "primary key must be integer or text, got {}",
                other.storage_name()
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RecordId::Integer(value) => JsonValue::from(*value),
            RecordId::Text(value) => JsonValue::String(value.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Integer(value) => write!(f, "{value}"),
            RecordId::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Integer(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Text(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId::Text(value)
    }
}

impl From<&RecordId> for RecordId {
    fn from(value: &RecordId) -> Self {
        value.clone()
    }
}

/// Semantic column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }

    /// Encode a JSON value for storage in a column of this type
    pub fn encode(self, column: &str, value: &JsonValue) -> StoreResult<Cell> {
        let mismatch = || {
            StoreError::Validation(format!(
                "column {column} expects {}, got {value}",
                self.as_str()
            ))
        };

        if value.is_null() {
            return Ok(Cell::Null);
        }

        match self {
            // u64 values above i64::MAX fall through to as_f64 and fail the range check
            ColumnType::Integer => match value.as_i64() {
                Some(int) => Ok(Cell::Integer(int)),
                None => match value.as_f64() {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
                    Some(float)
                        if float.fract() == 0.0
                            && float >= i64::MIN as f64
                            && float < i64::MAX as f64 =>
                    {
                        Ok(Cell::Integer(float as i64))
                    }
                    _ => Err(mismatch()),
                },
            },
            ColumnType::Real => value.as_f64().map(Cell::Real).ok_or_else(mismatch),
            ColumnType::Text => value
                .as_str()
                .map(|text| Cell::Text(text.to_string()))
                .ok_or_else(mismatch),
            ColumnType::Boolean => match value {
                JsonValue::Bool(flag) => Ok(Cell::from(*flag)),
                JsonValue::Number(number) => match number.as_i64() {
                    Some(0) => Ok(Cell::Integer(0)),
                    Some(1) => Ok(Cell::Integer(1)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            ColumnType::Timestamp => {
                let text = value.as_str().ok_or_else(mismatch)?;
                let parsed = DateTime::parse_from_rfc3339(text).map_err(|err| {
                    StoreError::Validation(format!(
                        "column {column} expects an RFC 3339 timestamp: {err}"
                    ))
                })?;
                Ok(Cell::Text(format_timestamp(&parsed.with_timezone(&Utc))))
            }
            ColumnType::Json => Ok(Cell::Text(serde_json::to_string(value)?)),
        }
    }

    /// Decode a stored cell into the JSON value seen by callers
    pub fn decode(self, cell: &Cell) -> JsonValue {
        match (self, cell) {
            (_, Cell::Null) => JsonValue::Null,
            (ColumnType::Boolean, Cell::Integer(value)) => JsonValue::Bool(*value != 0),
            (ColumnType::Json, Cell::Text(text)) => serde_json::from_str(text)
                .unwrap_or_else(|_| JsonValue::String(text.clone())),
            (_, Cell::Integer(value)) => JsonValue::from(*value),
            (_, Cell::Real(value)) => serde_json::Number::from_f64(*value)
                .map_or(JsonValue::Null, JsonValue::Number),
            (_, Cell::Text(text)) => JsonValue::String(text.clone()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical timestamp text used throughout the store
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}
