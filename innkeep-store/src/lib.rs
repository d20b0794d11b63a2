//! Offline-first embedded data layer for Innkeep
//!
//! The store keeps the hotel's working set in an in-memory SQLite database
//! whose full state is sealed with AES-256-GCM and written through to a local
//! key/value file after every committed mutation. Every local change to a
//! syncable table is recorded in an outbox for a later sync worker, and
//! server-side disagreements are kept in a conflict log until resolved.
//!
//! ```no_run
//! use innkeep_store::{DataService, StoreConfig};
//! use serde_json::json;
//!
//! # async fn run() -> innkeep_store::StoreResult<()> {
//! let service = DataService::new(StoreConfig::load(None)?);
//! service.initialize().await?;
//!
//! let guests = service.get_repository("guests").await?;
//! let guest = json!({"name": "Amina Idrissi", "email": "amina@example.com"});
//! if let serde_json::Value::Object(record) = guest {
//!     guests.create(record).await?;
//! }
//!
//! let pending = service.outbox().await?.list_pending(50).await?;
//! # let _ = pending;
//! # Ok(())
//! # }
//! ```

pub mod block_store;
pub mod config;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod migration;
pub mod outbox;
pub mod repository;
pub mod seed;
pub mod service;
pub mod settings;
pub mod tables;
pub mod value;

#[cfg(test)]
mod testing;

pub use block_store::{EncryptedBlockStore, KvBackend, MemoryKvBackend, SqliteKvBackend};
pub use config::StoreConfig;
pub use conflict::{ConflictLog, ConflictRecord, ConflictType, FieldDiff, Resolution};
pub use engine::Engine;
pub use error::{StoreError, StoreResult};
pub use events::StoreEvent;
pub use migration::{Migration, MigrationReport, MigrationRunner};
pub use outbox::{OperationType, OutboxCounts, OutboxEntry, Priority, SyncOutbox, SyncStatus};
pub use repository::{Query, Record, Repository, RepositoryRegistry};
pub use seed::SeedReport;
pub use service::{
    CheckStatus, DataService, HealthCheck, HealthReport, HealthStatus, ServiceState,
    StoreStatistics, TransactionOp, TxAction,
};
pub use settings::{LocalSettings, SettingValue};
pub use value::{Cell, ColumnType, RecordId};
