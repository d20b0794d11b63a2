//! Error types for the offline store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Data service is not ready (state: {0})")]
    NotReady(String),

    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Migration {name} failed: {source}")]
    MigrationFailed {
        name: String,
        source: Box<StoreError>,
    },

    #[error("Snapshot decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Transaction failed at operation {index}: {source}")]
    TransactionFailed {
        index: usize,
        source: Box<StoreError>,
    },

    #[error("Sync bookkeeping failed: {0}")]
    SyncBookkeeping(String),

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid sync status transition for entry {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Encryption error: {0}")]
    Encryption(#[from] crypto::CryptoError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Errors after which the local database cannot be trusted and the
    /// caller has to decide on a full reset.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            StoreError::DecryptionFailure(_)
                | StoreError::SchemaConflict(_)
                | StoreError::MigrationFailed { .. }
        )
    }

    /// True for `NotFound`, including when wrapped by a failed transaction
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::TransactionFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// Constraint failures (NOT NULL, UNIQUE, CHECK, STRICT type checks) keep
// their own variant; anything else from SQLite is an engine fault.
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(err.to_string())
            }
            _ => StoreError::Engine(err.to_string()),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        StoreError::Config(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_classification() {
        assert!(StoreError::DecryptionFailure("bad tag".into()).requires_reset());
        assert!(StoreError::SchemaConflict("rooms exists".into()).requires_reset());
        assert!(!StoreError::NotFound {
            table: "rooms".into(),
            id: "1".into()
        }
        .requires_reset());
        assert!(!StoreError::SyncBookkeeping("queue missing".into()).requires_reset());
    }

    #[test]
    fn test_not_found_through_transaction() {
        let err = StoreError::TransactionFailed {
            index: 1,
            source: Box::new(StoreError::NotFound {
                table: "rooms".into(),
                id: "9".into(),
            }),
        };
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Transaction failed at operation 1: Record not found: rooms/9"
        );
    }
}
