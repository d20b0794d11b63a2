use crate::value::{Cell, ColumnType};
use serde::{Deserialize, Serialize};

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const NEEDS_SYNC: &str = "needs_sync";
pub const SYNCED_AT: &str = "synced_at";

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Cell>,
}

impl ColumnDef {
    /// Nullable column without a default
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Cell>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// A value must be supplied on insert
    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }
}

/// How primary keys are assigned on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrategy {
    /// Integer keys generated by the engine when not supplied
    AutoIncrement,
    /// Keys supplied by the caller
    Provided,
}

/// Relation definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    pub key_strategy: KeyStrategy,
    pub columns: Vec<ColumnDef>,
    pub syncable: bool,
    /// Written only by the store's own components, never through repositories
    pub internal: bool,
}

impl TableSchema {
    /// Table keyed by an auto-incrementing integer `id`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            key_strategy: KeyStrategy::AutoIncrement,
            columns: vec![ColumnDef::new("id", ColumnType::Integer).not_null()],
            syncable: false,
            internal: false,
        }
    }

    /// Table keyed by a caller-supplied text column
    pub fn with_text_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: name.into(),
            primary_key: key.clone(),
            key_strategy: KeyStrategy::Provided,
            columns: vec![ColumnDef::new(key, ColumnType::Text).not_null()],
            syncable: false,
            internal: false,
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds `created_at` / `updated_at`
    pub fn timestamps(self) -> Self {
        self.column(ColumnDef::new(CREATED_AT, ColumnType::Timestamp))
            .column(ColumnDef::new(UPDATED_AT, ColumnType::Timestamp))
    }

    /// Adds `needs_sync` / `synced_at` and marks the table for outbox tracking
    pub fn syncable(mut self) -> Self {
        self.syncable = true;
        self.column(
            ColumnDef::new(NEEDS_SYNC, ColumnType::Boolean)
                .not_null()
                .default_value(true),
        )
        .column(ColumnDef::new(SYNCED_AT, ColumnType::Timestamp))
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Columns maintained by the store rather than the caller
    pub fn is_bookkeeping_column(&self, name: &str) -> bool {
        name == self.primary_key
            || matches!(name, CREATED_AT | UPDATED_AT | NEEDS_SYNC | SYNCED_AT)
    }
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|column| (*column).to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syncable_table_columns() {
        let schema = TableSchema::new("rooms")
            .column(ColumnDef::new("room_number", ColumnType::Text).not_null())
            .timestamps()
            .syncable();

        assert!(schema.syncable);
        assert_eq!(
            schema.column_names().collect::<Vec<_>>(),
            vec!["id", "room_number", "created_at", "updated_at", "needs_sync", "synced_at"]
        );

        let needs_sync = schema.get_column(NEEDS_SYNC).unwrap();
        assert!(!needs_sync.nullable);
        assert!(!needs_sync.is_required());
        assert!(schema.get_column("room_number").unwrap().is_required());
    }

    #[test]
    fn test_text_keyed_table() {
        let schema = TableSchema::with_text_key("local_settings", "key");
        assert_eq!(schema.primary_key, "key");
        assert_eq!(schema.key_strategy, KeyStrategy::Provided);
        assert!(schema.is_bookkeeping_column("key"));
        assert!(!schema.is_bookkeeping_column("value"));
    }
}
