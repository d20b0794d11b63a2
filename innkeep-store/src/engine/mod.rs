//! Relational engine adapter
//!
//! Typed [`Statement`]s are rendered to SQL and run against an in-memory
//! SQLite connection; every value is bound as a parameter. The engine keeps a
//! catalog of table and index definitions next to the connection so that
//! statements naming unknown tables or columns are rejected with typed errors
//! before reaching SQLite.
//!
//! The whole database can be exported to bytes and imported back, which is
//! how the data service persists it through the encrypted block store.
//!
//! Guarantees:
//! - a rejected statement leaves the state untouched
//! - `rollback` restores the state exactly as it was at `begin`
//! - `export` is deterministic: identical state yields identical bytes

pub mod schema;
mod sql;
pub mod statement;

pub use schema::{ColumnDef, IndexDef, KeyStrategy, TableSchema};
pub use statement::{Filter, Select, SortOrder, Statement, Values};

use crate::error::{StoreError, StoreResult};
use crate::value::{Cell, ColumnType, RecordId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sql::ident;
use std::collections::{BTreeMap, BTreeSet};

/// A stored row: every schema column is present
pub type Row = BTreeMap<String, Cell>;

const SNAPSHOT_MAGIC: &[u8; 4] = b"IKDB";
const SNAPSHOT_VERSION: u8 = 2;

/// Table and index definitions mirrored from the SQLite schema
#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, TableSchema>,
    indexes: BTreeMap<String, IndexDef>,
}

impl Catalog {
    fn table(&self, name: &str) -> StoreResult<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn check_columns<'a>(
        &self,
        table: &str,
        columns: impl IntoIterator<Item = &'a String>,
    ) -> StoreResult<&TableSchema> {
        let schema = self.table(table)?;
        for column in columns {
            if !schema.has_column(column) {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
        Ok(schema)
    }
}

#[derive(Serialize, Deserialize)]
struct TableDump {
    schema: TableSchema,
    sequence: Option<i64>,
    rows: Vec<Vec<Cell>>,
}

/// Logical snapshot body: tables by name, rows by primary key
#[derive(Serialize, Deserialize)]
struct Dump {
    tables: Vec<TableDump>,
    indexes: Vec<IndexDef>,
}

#[derive(Debug)]
pub struct Engine {
    conn: Connection,
    catalog: Catalog,
    saved_catalog: Option<Catalog>,
    last_insert_id: Option<RecordId>,
}

impl Engine {
    /// Empty engine on a fresh in-memory database
    pub fn new() -> StoreResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            catalog: Catalog::default(),
            saved_catalog: None,
            last_insert_id: None,
        })
    }

    /// Build an engine from exported bytes
    pub fn from_snapshot(bytes: &[u8]) -> StoreResult<Self> {
        let dump = Self::decode(bytes)?;
        Self::load(dump)
    }

    /// Execute a statement, returning the number of rows affected
    pub fn execute(&mut self, statement: Statement) -> StoreResult<u64> {
        match statement {
            Statement::CreateTable {
                schema,
                if_not_exists,
            } => {
                if self.catalog.tables.contains_key(&schema.name) {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(StoreError::SchemaConflict(format!(
                        "table {} already exists",
                        schema.name
                    )));
                }
                self.create_table(schema)?;
                Ok(0)
            }
            Statement::DropTable { name, if_exists } => {
                if !self.catalog.tables.contains_key(&name) {
                    if if_exists {
                        return Ok(0);
                    }
                    return Err(StoreError::UnknownTable(name));
                }
                self.conn
                    .execute_batch(&format!("DROP TABLE {}", ident(&name)))?;
                self.catalog.tables.remove(&name);
                self.catalog.indexes.retain(|_, index| index.table != name);
                Ok(0)
            }
            Statement::AddColumn { table, column } => {
                let schema = self.catalog.table(&table)?;
                if schema.has_column(&column.name) {
                    return Err(StoreError::SchemaConflict(format!(
                        "column {table}.{} already exists",
                        column.name
                    )));
                }
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    ident(&table),
                    sql::column_definition(&column)?
                ))?;
                if let Some(schema) = self.catalog.tables.get_mut(&table) {
                    schema.columns.push(column);
                }
                Ok(0)
            }
            Statement::CreateIndex {
                index,
                if_not_exists,
            } => {
                if self.catalog.indexes.contains_key(&index.name) {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(StoreError::SchemaConflict(format!(
                        "index {} already exists",
                        index.name
                    )));
                }
                self.create_index(index)?;
                Ok(0)
            }
            Statement::Insert { table, values } => {
                let id = self.insert(&table, &values)?;
                self.last_insert_id = Some(id);
                Ok(1)
            }
            Statement::Update { table, set, filter } => self.update(&table, &set, &filter),
            Statement::Delete { table, filter } => {
                self.catalog.check_columns(
                    &table,
                    filter.conditions.iter().map(|(column, _)| column),
                )?;
                let mut bound = Vec::new();
                let sql = format!(
                    "DELETE FROM {}{}",
                    ident(&table),
                    sql::where_clause(&filter, &mut bound)
                );
                let changed = self.conn.execute(&sql, params_from_iter(bound))?;
                Ok(changed as u64)
            }
            Statement::Begin => self.begin().map(|()| 0),
            Statement::Commit => self.commit().map(|()| 0),
            Statement::Rollback => self.rollback().map(|()| 0),
        }
    }

    fn validate_schema(schema: &TableSchema) -> StoreResult<()> {
        if schema.name.is_empty() {
            return Err(StoreError::InvalidStatement(
                "table name must not be empty".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for column in &schema.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(StoreError::InvalidStatement(format!(
                    "duplicate column {}.{}",
                    schema.name, column.name
                )));
            }
        }
        match schema.get_column(&schema.primary_key) {
            Some(column) if !column.nullable => {}
            _ => {
                return Err(StoreError::InvalidStatement(format!(
                    "table {} needs a NOT NULL primary key column {}",
                    schema.name, schema.primary_key
                )))
            }
        }
        if schema.key_strategy == KeyStrategy::AutoIncrement {
            let is_integer = schema
                .get_column(&schema.primary_key)
                .is_some_and(|column| column.column_type == ColumnType::Integer);
            if !is_integer {
                return Err(StoreError::InvalidStatement(format!(
                    "auto-increment key {}.{} must be an integer",
                    schema.name, schema.primary_key
                )));
            }
        }
        Ok(())
    }

    fn create_table(&mut self, schema: TableSchema) -> StoreResult<()> {
        Self::validate_schema(&schema)?;
        self.conn.execute_batch(&sql::create_table(&schema)?)?;
        self.catalog.tables.insert(schema.name.clone(), schema);
        Ok(())
    }

    fn create_index(&mut self, index: IndexDef) -> StoreResult<()> {
        if index.columns.is_empty() {
            return Err(StoreError::InvalidStatement(format!(
                "index {} has no columns",
                index.name
            )));
        }
        self.catalog.check_columns(&index.table, &index.columns)?;
        self.conn.execute_batch(&sql::create_index(&index))?;
        self.catalog.indexes.insert(index.name.clone(), index);
        Ok(())
    }

    fn insert(&self, table: &str, values: &Values) -> StoreResult<RecordId> {
        let schema = self.catalog.check_columns(table, values.keys())?;
        let pk = &schema.primary_key;
        let generated = schema.key_strategy == KeyStrategy::AutoIncrement
            && values.get(pk).map_or(true, Cell::is_null);

        let supplied: Vec<(&String, &Cell)> = values
            .iter()
            .filter(|(column, _)| !(generated && *column == pk))
            .collect();
        let sql = if supplied.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", ident(table))
        } else {
            let columns: Vec<String> = supplied.iter().map(|(column, _)| ident(column)).collect();
            let slots = vec!["?"; supplied.len()];
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                ident(table),
                columns.join(", "),
                slots.join(", ")
            )
        };
        self.conn
            .execute(&sql, params_from_iter(supplied.iter().map(|(_, cell)| *cell)))?;

        if generated {
            return Ok(RecordId::Integer(self.conn.last_insert_rowid()));
        }
        RecordId::from_cell(values.get(pk).unwrap_or(&Cell::Null))
    }

    fn update(&self, table: &str, set: &Values, filter: &Filter) -> StoreResult<u64> {
        if set.is_empty() {
            return Err(StoreError::InvalidStatement(format!(
                "UPDATE {table} has no assignments"
            )));
        }
        let schema = self.catalog.check_columns(
            table,
            set.keys()
                .chain(filter.conditions.iter().map(|(column, _)| column)),
        )?;
        if set.contains_key(&schema.primary_key) {
            return Err(StoreError::InvalidStatement(format!(
                "primary key {table}.{} cannot be updated",
                schema.primary_key
            )));
        }

        let assignments: Vec<String> = set
            .keys()
            .map(|column| format!("{} = ?", ident(column)))
            .collect();
        let mut bound: Vec<&Cell> = set.values().collect();
        let sql = format!(
            "UPDATE {} SET {}{}",
            ident(table),
            assignments.join(", "),
            sql::where_clause(filter, &mut bound)
        );
        let changed = self.conn.execute(&sql, params_from_iter(bound))?;
        Ok(changed as u64)
    }

    pub fn query(&self, select: &Select) -> StoreResult<Vec<Row>> {
        let schema = self.catalog.check_columns(
            &select.table,
            select
                .filter
                .conditions
                .iter()
                .map(|(column, _)| column)
                .chain(select.order_by.iter().map(|(column, _)| column)),
        )?;
        let mut bound = Vec::new();
        let sql = sql::select(schema, select, &mut bound);
        let mut statement = self.conn.prepare_cached(&sql)?;
        let rows = statement.query_map(params_from_iter(bound), |row| {
            let mut values = Row::new();
            for (index, column) in schema.columns.iter().enumerate() {
                values.insert(column.name.clone(), row.get(index)?);
            }
            Ok(values)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self, table: &str, filter: &Filter) -> StoreResult<usize> {
        self.catalog
            .check_columns(table, filter.conditions.iter().map(|(column, _)| column))?;
        let mut bound = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            ident(table),
            sql::where_clause(filter, &mut bound)
        );
        let count: i64 = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params_from_iter(bound), |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn begin(&mut self) -> StoreResult<()> {
        if self.saved_catalog.is_some() {
            return Err(StoreError::InvalidStatement(
                "a transaction is already open".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN")?;
        self.saved_catalog = Some(self.catalog.clone());
        Ok(())
    }

    pub fn commit(&mut self) -> StoreResult<()> {
        if self.saved_catalog.is_none() {
            return Err(StoreError::InvalidStatement(
                "no transaction to commit".to_string(),
            ));
        }
        self.conn.execute_batch("COMMIT")?;
        self.saved_catalog = None;
        Ok(())
    }

    pub fn rollback(&mut self) -> StoreResult<()> {
        let Some(saved) = self.saved_catalog.take() else {
            return Err(StoreError::InvalidStatement(
                "no transaction to roll back".to_string(),
            ));
        };
        self.catalog = saved;
        // SQLite may already have rolled back on its own after a fatal error
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.saved_catalog.is_some()
    }

    /// Key assigned by the most recent successful insert
    pub fn last_insert_id(&self) -> Option<&RecordId> {
        self.last_insert_id.as_ref()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.catalog.tables.contains_key(name)
    }

    pub fn table_schema(&self, name: &str) -> Option<&TableSchema> {
        self.catalog.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.tables.keys().cloned().collect()
    }

    pub fn row_count(&self, name: &str) -> StoreResult<usize> {
        self.count(name, &Filter::all())
    }

    /// Serialize the full database: schemas, indexes, rows and key sequences
    pub fn export(&self) -> StoreResult<Vec<u8>> {
        let mut tables = Vec::with_capacity(self.catalog.tables.len());
        for schema in self.catalog.tables.values() {
            let rows = self
                .query(&Select::from(schema.name.as_str()))?
                .into_iter()
                .map(|mut row| {
                    schema
                        .column_names()
                        .map(|column| row.remove(column).unwrap_or(Cell::Null))
                        .collect()
                })
                .collect();
            tables.push(TableDump {
                schema: schema.clone(),
                sequence: self.sequence(schema)?,
                rows,
            });
        }
        let dump = Dump {
            tables,
            indexes: self.catalog.indexes.values().cloned().collect(),
        };

        let body = bincode::serialize(&dump)?;
        let mut bytes = Vec::with_capacity(SNAPSHOT_MAGIC.len() + 1 + body.len());
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Replace the full database with previously exported bytes
    pub fn import(&mut self, bytes: &[u8]) -> StoreResult<()> {
        if self.in_transaction() {
            return Err(StoreError::InvalidStatement(
                "cannot import while a transaction is open".to_string(),
            ));
        }
        let dump = Self::decode(bytes)?;
        *self = Self::load(dump)?;
        Ok(())
    }

    fn sequence(&self, schema: &TableSchema) -> StoreResult<Option<i64>> {
        if schema.key_strategy != KeyStrategy::AutoIncrement {
            return Ok(None);
        }
        let seq = self
            .conn
            .prepare_cached("SELECT seq FROM sqlite_sequence WHERE name = ?1")?
            .query_row(params![schema.name], |row| row.get(0))
            .optional()?;
        Ok(seq)
    }

    fn decode(bytes: &[u8]) -> StoreResult<Dump> {
        let (magic, rest) = bytes.split_at(bytes.len().min(SNAPSHOT_MAGIC.len()));
        if magic != SNAPSHOT_MAGIC {
            return Err(StoreError::Serialization(
                "not an engine snapshot".to_string(),
            ));
        }
        match rest.split_first() {
            Some((&SNAPSHOT_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((version, _)) => Err(StoreError::Serialization(format!(
                "unsupported engine snapshot version {version}"
            ))),
            None => Err(StoreError::Serialization(
                "truncated engine snapshot".to_string(),
            )),
        }
    }

    fn load(dump: Dump) -> StoreResult<Self> {
        let mut engine = Self::new()?;
        engine.conn.execute_batch("BEGIN")?;

        for table in dump.tables {
            let TableDump {
                schema,
                sequence,
                rows,
            } = table;
            let name = schema.name.clone();
            let columns: Vec<String> = schema.column_names().map(ident).collect();
            let slots = vec!["?"; columns.len()];
            engine.create_table(schema)?;

            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                ident(&name),
                columns.join(", "),
                slots.join(", ")
            );
            {
                let mut insert = engine.conn.prepare(&sql)?;
                for row in &rows {
                    insert.execute(params_from_iter(row))?;
                }
            }

            if let Some(seq) = sequence {
                engine
                    .conn
                    .execute("DELETE FROM sqlite_sequence WHERE name = ?1", params![name])?;
                engine.conn.execute(
                    "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
                    params![name, seq],
                )?;
            }
        }
        for index in dump.indexes {
            engine.create_index(index)?;
        }

        engine.conn.execute_batch("COMMIT")?;
        Ok(engine)
    }
}
