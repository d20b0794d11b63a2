//! Ordered, idempotent schema migrations
//!
//! Applied migrations are recorded by name in the `migrations` table; a
//! recorded name is never applied again. Each migration runs in its own
//! transaction together with the insert of its record, so a failure leaves
//! neither the schema change nor the record behind.

use crate::engine::{ColumnDef, Engine, Filter, IndexDef, Select, SortOrder, Statement, TableSchema, Values};
use crate::error::{StoreError, StoreResult};
use crate::value::{now_timestamp, Cell, ColumnType};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const MIGRATIONS_TABLE: &str = "migrations";

type ApplyFn = dyn Fn(&mut Engine) -> StoreResult<()> + Send + Sync;

/// A named schema change
#[derive(Clone)]
pub struct Migration {
    name: String,
    apply: Arc<ApplyFn>,
}

impl Migration {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut Engine) -> StoreResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    /// Migration executing a fixed list of statements in order
    pub fn from_statements(name: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self::new(name, move |engine: &mut Engine| {
            for statement in &statements {
                engine.execute(statement.clone())?;
            }
            Ok(())
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration").field("name", &self.name).finish()
    }
}

/// Names applied and skipped by one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    fn migrations_schema() -> TableSchema {
        TableSchema::new(MIGRATIONS_TABLE)
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("executed_at", ColumnType::Timestamp).not_null())
    }

    fn ensure_table(engine: &mut Engine) -> StoreResult<()> {
        if engine.has_table(MIGRATIONS_TABLE) {
            return Ok(());
        }
        engine.begin()?;
        let created = engine
            .execute(Statement::create_table(Self::migrations_schema()))
            .and_then(|_| {
                engine.execute(Statement::create_index(
                    IndexDef::new("idx_migrations_name", MIGRATIONS_TABLE, &["name"]).unique(),
                ))
            });
        match created {
            Ok(_) => engine.commit(),
            Err(err) => {
                engine.rollback()?;
                Err(err)
            }
        }
    }

    /// Apply every migration not yet recorded, in order. Stops at the first
    /// failure, which is returned as `MigrationFailed`.
    pub fn run(&self, engine: &mut Engine) -> StoreResult<MigrationReport> {
        let mut names = BTreeSet::new();
        for migration in &self.migrations {
            if !names.insert(migration.name.as_str()) {
                return Err(StoreError::Validation(format!(
                    "duplicate migration name {}",
                    migration.name
                )));
            }
        }

        Self::ensure_table(engine)?;

        let mut report = MigrationReport::default();
        for migration in &self.migrations {
            if Self::is_applied(engine, &migration.name)? {
                tracing::debug!(migration = %migration.name, "Migration already applied");
                report.skipped.push(migration.name.clone());
                continue;
            }

            engine.begin()?;
            let outcome = (migration.apply)(engine).and_then(|()| {
                let mut values = Values::new();
                values.insert("name".into(), Cell::from(migration.name.as_str()));
                values.insert("executed_at".into(), Cell::from(now_timestamp()));
                engine.execute(Statement::insert(MIGRATIONS_TABLE, values))
            });

            match outcome {
                Ok(_) => {
                    engine.commit()?;
                    tracing::info!(migration = %migration.name, "Applied migration");
                    report.applied.push(migration.name.clone());
                }
                Err(err) => {
                    engine.rollback()?;
                    tracing::error!(migration = %migration.name, error = %err, "Migration failed");
                    return Err(StoreError::MigrationFailed {
                        name: migration.name.clone(),
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(report)
    }

    fn is_applied(engine: &Engine, name: &str) -> StoreResult<bool> {
        Ok(engine.count(MIGRATIONS_TABLE, &Filter::all().eq("name", name))? > 0)
    }
}

/// Names of recorded migrations in execution order
pub fn applied_migrations(engine: &Engine) -> StoreResult<Vec<String>> {
    if !engine.has_table(MIGRATIONS_TABLE) {
        return Ok(Vec::new());
    }
    let rows = engine.query(&Select::from(MIGRATIONS_TABLE).order_by("id", SortOrder::Asc))?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("name").and_then(Cell::as_str).map(str::to_string))
        .collect())
}
