//! Data service façade
//!
//! [`DataService`] owns the store lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready
//!                              \-> Failed (until the next initialize)
//! ```
//!
//! Repositories, the outbox, the conflict log and settings are only handed
//! out once the service is `Ready`; a failed initialization never exposes a
//! partial set.

use crate::block_store::{
    resolve_device_id, EncryptedBlockStore, KvBackend, SqliteKvBackend,
};
use crate::config::StoreConfig;
use crate::conflict::{self, ConflictLog};
use crate::context::{PersistStats, StoreContext};
use crate::engine::{Engine, Filter, Statement};
use crate::error::{StoreError, StoreResult};
use crate::events::StoreEvent;
use crate::migration::{self, Migration, MigrationRunner, MIGRATIONS_TABLE};
use crate::outbox::{self, OutboxCounts, OutboxPolicy, SyncOutbox};
use crate::repository::{Record, Repository, RepositoryRegistry};
use crate::seed::{self, SeedReport};
use crate::settings::{LocalSettings, SETTINGS_TABLE};
use crate::tables;
use crate::value::{now_timestamp, RecordId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Externally visible lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Uninitialized => write!(f, "uninitialized"),
            ServiceState::Initializing => write!(f, "initializing"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

/// Everything constructed by a successful initialization
struct ReadyServices {
    ctx: Arc<StoreContext>,
    registry: RepositoryRegistry,
    outbox: SyncOutbox,
    conflicts: ConflictLog,
    settings: LocalSettings,
}

enum Phase {
    Uninitialized,
    Initializing,
    Ready(Arc<ReadyServices>),
    Failed(String),
}

impl Phase {
    fn state(&self) -> ServiceState {
        match self {
            Phase::Uninitialized => ServiceState::Uninitialized,
            Phase::Initializing => ServiceState::Initializing,
            Phase::Ready(_) => ServiceState::Ready,
            Phase::Failed(error) => ServiceState::Failed(error.clone()),
        }
    }
}

/// One step of [`DataService::execute_transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum TxAction {
    Create(Record),
    Update { id: RecordId, changes: Record },
    Delete { id: RecordId },
    MarkSynced { id: RecordId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOp {
    pub repository: String,
    pub action: TxAction,
}

impl TransactionOp {
    pub fn create(repository: impl Into<String>, record: Record) -> Self {
        Self {
            repository: repository.into(),
            action: TxAction::Create(record),
        }
    }

    pub fn update(
        repository: impl Into<String>,
        id: impl Into<RecordId>,
        changes: Record,
    ) -> Self {
        Self {
            repository: repository.into(),
            action: TxAction::Update {
                id: id.into(),
                changes,
            },
        }
    }

    pub fn delete(repository: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            repository: repository.into(),
            action: TxAction::Delete { id: id.into() },
        }
    }

    pub fn mark_synced(repository: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            repository: repository.into(),
            action: TxAction::MarkSynced { id: id.into() },
        }
    }
}

/// Point-in-time counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    /// Row count per table
    pub tables: BTreeMap<String, usize>,
    pub outbox: OutboxCounts,
    pub unresolved_conflicts: usize,
    pub applied_migrations: Vec<String>,
    pub persistence: PersistStats,
    pub key_fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl HealthCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub checked_at: String,
}

impl HealthReport {
    fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            checks,
            checked_at: now_timestamp(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

/// Entry point to the offline store
pub struct DataService {
    config: StoreConfig,
    backend: Option<Arc<dyn KvBackend>>,
    extra_migrations: Vec<Migration>,
    events: broadcast::Sender<StoreEvent>,
    phase: RwLock<Phase>,
    init_lock: Mutex<()>,
}

impl DataService {
    pub fn new(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            backend: None,
            extra_migrations: Vec::new(),
            events,
            phase: RwLock::new(Phase::Uninitialized),
            init_lock: Mutex::new(()),
        }
    }

    /// Use `backend` instead of opening the SQLite file at `db_path`
    pub fn with_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Migrations applied after the built-in ones
    pub fn with_extra_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.extra_migrations = migrations;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn state(&self) -> ServiceState {
        self.phase.read().await.state()
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.phase.read().await, Phase::Ready(_))
    }

    /// Bring the store to `Ready`. Calling this on a ready service is a
    /// no-op; on a failed one it retries from scratch.
    pub async fn initialize(&self) -> StoreResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_ready().await {
            return Ok(());
        }

        *self.phase.write().await = Phase::Initializing;
        tracing::info!(
            db_path = %self.config.db_path.display(),
            "Initializing offline store"
        );

        match self.open().await {
            Ok(services) => {
                *self.phase.write().await = Phase::Ready(Arc::new(services));
                tracing::info!("Offline store ready");
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    requires_reset = err.requires_reset(),
                    "Offline store initialization failed"
                );
                *self.phase.write().await = Phase::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn migrations(&self) -> Vec<Migration> {
        let mut migrations = tables::default_migrations();
        migrations.extend(self.extra_migrations.iter().cloned());
        migrations
    }

    async fn open(&self) -> StoreResult<ReadyServices> {
        let config = &self.config;
        config.validate()?;

        let backend: Arc<dyn KvBackend> = match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => Arc::new(SqliteKvBackend::open(&config.db_path).await?),
        };
        let device_id = resolve_device_id(backend.as_ref(), config.device_id.as_deref()).await?;

        let app_salt = config.app_salt.clone();
        let iterations = config.kdf_iterations;
        let block_store = tokio::task::spawn_blocking(move || {
            EncryptedBlockStore::open(backend, &device_id, &app_salt, iterations)
        })
        .await
        .map_err(|err| StoreError::Internal(format!("key derivation task failed: {err}")))??;

        // A snapshot that exists but cannot be opened is an error, never a
        // reason to start over with an empty database.
        let (engine, fresh) = match block_store.get(&config.snapshot_key).await? {
            Some(bytes) => (Engine::from_snapshot(&bytes)?, false),
            None => (Engine::new()?, true),
        };
        tracing::info!(
            snapshot_key = %config.snapshot_key,
            fresh = fresh,
            tables = engine.table_names().len(),
            "Loaded snapshot"
        );

        let ctx = Arc::new(StoreContext::new(
            engine,
            block_store,
            config.snapshot_key.clone(),
            OutboxPolicy::new(config.high_priority_tables.iter().cloned()),
            self.events.clone(),
        ));
        if fresh {
            ctx.maintain(|_| Ok(())).await?;
        }

        let runner = MigrationRunner::new(self.migrations());
        let report = ctx.maintain(|engine| runner.run(engine)).await?;
        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Migrations complete"
        );

        let names = tables::all_tables().into_iter().map(|schema| schema.name);
        let registry = ctx
            .read(|engine| RepositoryRegistry::from_engine(&ctx, engine, names))
            .await?;

        if config.seed_defaults {
            let seeded = ctx
                .write(|uow| seed::seed_defaults_in(uow, &registry))
                .await?;
            if seeded != SeedReport::default() {
                tracing::info!(
                    rows = seeded.rows,
                    settings = seeded.settings,
                    "Seeded default data"
                );
            }
        }

        Ok(ReadyServices {
            outbox: SyncOutbox::new(Arc::clone(&ctx)),
            conflicts: ConflictLog::new(Arc::clone(&ctx), registry.clone()),
            settings: LocalSettings::new(registry.get(SETTINGS_TABLE)?, Arc::clone(&ctx)),
            registry,
            ctx,
        })
    }

    async fn ready(&self) -> StoreResult<Arc<ReadyServices>> {
        match &*self.phase.read().await {
            Phase::Ready(services) => Ok(Arc::clone(services)),
            other => Err(StoreError::NotReady(other.state().to_string())),
        }
    }

    pub async fn get_repository(&self, name: &str) -> StoreResult<Repository> {
        self.ready().await?.registry.get(name)
    }

    pub async fn repositories(&self) -> StoreResult<RepositoryRegistry> {
        Ok(self.ready().await?.registry.clone())
    }

    pub async fn outbox(&self) -> StoreResult<SyncOutbox> {
        Ok(self.ready().await?.outbox.clone())
    }

    pub async fn conflicts(&self) -> StoreResult<ConflictLog> {
        Ok(self.ready().await?.conflicts.clone())
    }

    pub async fn settings(&self) -> StoreResult<LocalSettings> {
        Ok(self.ready().await?.settings.clone())
    }

    /// Run all operations in one transaction. The first failing operation
    /// rolls back every earlier one and is reported with its index.
    /// Returns one record per operation: the created, updated or synced
    /// record, or for a delete the row as it was.
    pub async fn execute_transaction(
        &self,
        operations: Vec<TransactionOp>,
    ) -> StoreResult<Vec<Record>> {
        let services = self.ready().await?;

        let mut steps = Vec::with_capacity(operations.len());
        for (index, op) in operations.into_iter().enumerate() {
            let repository = services
                .registry
                .get(&op.repository)
                .map_err(|source| StoreError::TransactionFailed {
                    index,
                    source: Box::new(source),
                })?;
            steps.push((repository, op.action));
        }
        let count = steps.len();

        let results = services
            .ctx
            .write(|uow| {
                let mut results = Vec::with_capacity(steps.len());
                for (index, (repository, action)) in steps.into_iter().enumerate() {
                    let outcome = match action {
                        TxAction::Create(record) => repository.create_in(uow, record, false),
                        TxAction::Update { id, changes } => repository.update_in(uow, &id, changes),
                        TxAction::Delete { id } => repository.delete_in(uow, &id),
                        TxAction::MarkSynced { id } => repository.mark_synced_in(uow, &id),
                    };
                    let record = outcome.map_err(|source| StoreError::TransactionFailed {
                        index,
                        source: Box::new(source),
                    })?;
                    results.push(record);
                }
                Ok(results)
            })
            .await;

        match &results {
            Ok(_) => tracing::debug!(operations = count, "Transaction committed"),
            Err(err) => tracing::warn!(operations = count, error = %err, "Transaction rolled back"),
        }
        results
    }

    pub async fn statistics(&self) -> StoreResult<StoreStatistics> {
        let services = self.ready().await?;
        let ctx = &services.ctx;

        let (tables, outbox, unresolved_conflicts, applied_migrations) = ctx
            .read(|engine| {
                let mut tables = BTreeMap::new();
                for name in engine.table_names() {
                    let rows = engine.row_count(&name)?;
                    tables.insert(name, rows);
                }
                Ok((
                    tables,
                    outbox::status_counts(engine)?,
                    conflict::unresolved_count(engine)?,
                    migration::applied_migrations(engine)?,
                ))
            })
            .await?;

        Ok(StoreStatistics {
            tables,
            outbox,
            unresolved_conflicts,
            applied_migrations,
            persistence: ctx.persist_stats().await,
            key_fingerprint: ctx.block_store().key_fingerprint(),
        })
    }

    /// Never fails; problems are reported as failing checks
    pub async fn check_health(&self) -> HealthReport {
        let services = match self.ready().await {
            Ok(services) => services,
            Err(_) => {
                let state = self.state().await;
                return HealthReport::from_checks(vec![HealthCheck::new(
                    "service",
                    CheckStatus::Fail,
                    format!("data service is {state}"),
                )]);
            }
        };

        let mut checks = vec![HealthCheck::new("service", CheckStatus::Pass, "ready")];
        let ctx = &services.ctx;
        let expected_migrations = self.migrations().len();

        let engine_checks = ctx
            .read(|engine| {
                let mut checks = Vec::new();

                let missing: Vec<String> = services
                    .registry
                    .names()
                    .filter(|name| !engine.has_table(name))
                    .map(str::to_string)
                    .collect();
                checks.push(if missing.is_empty() {
                    HealthCheck::new(
                        "tables",
                        CheckStatus::Pass,
                        format!("{} tables present", services.registry.len()),
                    )
                } else {
                    HealthCheck::new(
                        "tables",
                        CheckStatus::Fail,
                        format!("missing tables: {}", missing.join(", ")),
                    )
                });

                checks.push(match migration::applied_migrations(engine) {
                    Ok(applied) if applied.len() >= expected_migrations => HealthCheck::new(
                        "migrations",
                        CheckStatus::Pass,
                        format!("{} applied", applied.len()),
                    ),
                    Ok(applied) => HealthCheck::new(
                        "migrations",
                        CheckStatus::Warn,
                        format!("{} of {expected_migrations} applied", applied.len()),
                    ),
                    Err(err) => HealthCheck::new("migrations", CheckStatus::Fail, err.to_string()),
                });

                checks.push(match outbox::status_counts(engine) {
                    Ok(counts) if counts.failed > 0 => HealthCheck::new(
                        "outbox",
                        CheckStatus::Warn,
                        format!("{} failed entries", counts.failed),
                    ),
                    Ok(counts) => HealthCheck::new(
                        "outbox",
                        CheckStatus::Pass,
                        format!("{} pending entries", counts.pending),
                    ),
                    Err(err) => HealthCheck::new("outbox", CheckStatus::Fail, err.to_string()),
                });

                checks.push(match conflict::unresolved_count(engine) {
                    Ok(0) => HealthCheck::new("conflicts", CheckStatus::Pass, "none unresolved"),
                    Ok(count) => HealthCheck::new(
                        "conflicts",
                        CheckStatus::Warn,
                        format!("{count} unresolved"),
                    ),
                    Err(err) => HealthCheck::new("conflicts", CheckStatus::Fail, err.to_string()),
                });

                Ok(checks)
            })
            .await;
        match engine_checks {
            Ok(engine_checks) => checks.extend(engine_checks),
            Err(err) => checks.push(HealthCheck::new("engine", CheckStatus::Fail, err.to_string())),
        }

        checks.push(match ctx.block_store().get(ctx.snapshot_key()).await {
            Ok(Some(bytes)) => HealthCheck::new(
                "snapshot",
                CheckStatus::Pass,
                format!("{} bytes", bytes.len()),
            ),
            Ok(None) => HealthCheck::new("snapshot", CheckStatus::Fail, "no snapshot persisted"),
            Err(err) => HealthCheck::new("snapshot", CheckStatus::Fail, err.to_string()),
        });

        HealthReport::from_checks(checks)
    }

    /// Delete every row outside the migrations table, then seed the
    /// defaults again. Schema and migration history are kept.
    pub async fn reset(&self) -> StoreResult<SeedReport> {
        let services = self.ready().await?;

        let report = services
            .ctx
            .write(|uow| {
                let mut deleted = 0;
                for name in uow.engine().table_names() {
                    if name == MIGRATIONS_TABLE {
                        continue;
                    }
                    deleted += uow
                        .engine_mut()
                        .execute(Statement::delete(name, Filter::all()))?;
                }
                tracing::debug!(rows = deleted, "Cleared local data");
                seed::seed_defaults_in(uow, &services.registry)
            })
            .await?;

        tracing::warn!(
            rows = report.rows,
            settings = report.settings,
            "Local database reset"
        );
        Ok(report)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Plaintext export of the committed engine state
    pub async fn export_state(&self) -> StoreResult<Vec<u8>> {
        self.ready().await?.ctx.export().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::MemoryKvBackend;
    use crate::testing::TEST_ITERATIONS;

    fn service() -> DataService {
        let config = StoreConfig {
            kdf_iterations: TEST_ITERATIONS,
            device_id: Some("front-desk-1".into()),
            ..StoreConfig::default()
        };
        DataService::new(config).with_backend(Arc::new(MemoryKvBackend::new()))
    }

    #[tokio::test]
    async fn test_not_ready_before_initialize() {
        let service = service();
        assert_eq!(service.state().await, ServiceState::Uninitialized);
        assert!(matches!(
            service.get_repository("rooms").await,
            Err(StoreError::NotReady(_))
        ));

        let health = service.check_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.check("service").unwrap().status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let service = service();
        service.initialize().await.unwrap();
        service.initialize().await.unwrap();
        assert_eq!(service.state().await, ServiceState::Ready);

        let rooms = service.get_repository("rooms").await.unwrap();
        assert_eq!(rooms.count(&crate::repository::Query::new()).await.unwrap(), 9);
        assert!(matches!(
            service.get_repository("bookings").await,
            Err(StoreError::UnknownRepository(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_migration_leaves_failed_state() {
        let service = service().with_extra_migrations(vec![Migration::new(
            "003_broken",
            |_: &mut Engine| Err(StoreError::Internal("boom".into())),
        )]);

        let err = service.initialize().await.unwrap_err();
        assert!(matches!(err, StoreError::MigrationFailed { ref name, .. } if name == "003_broken"));
        assert!(matches!(service.state().await, ServiceState::Failed(_)));
        assert!(service.outbox().await.is_err());
    }

    #[test]
    fn test_health_rollup() {
        let report = HealthReport::from_checks(vec![
            HealthCheck::new("a", CheckStatus::Pass, ""),
            HealthCheck::new("b", CheckStatus::Warn, ""),
        ]);
        assert_eq!(report.status, HealthStatus::Warning);

        let report = HealthReport::from_checks(vec![
            HealthCheck::new("a", CheckStatus::Fail, ""),
            HealthCheck::new("b", CheckStatus::Warn, ""),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }
}
