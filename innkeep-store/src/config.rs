//! Store configuration
//!
//! Values come from built-in defaults, an optional file, and `INNKEEP_*`
//! environment variables, in that order of precedence (lowest first).

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "INNKEEP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file backing the key/value facility
    pub db_path: PathBuf,
    /// Logical name the sealed snapshot is stored under
    pub snapshot_key: String,
    /// Salt mixed into the snapshot key derivation. Changing it makes
    /// existing snapshots unreadable.
    pub app_salt: String,
    /// Fixed device identifier; generated and persisted when absent
    pub device_id: Option<String>,
    pub kdf_iterations: u32,
    /// Tables whose outbox entries drain first
    pub high_priority_tables: Vec<String>,
    pub seed_defaults: bool,
    /// Capacity of the store event channel
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("innkeep_local.db"),
            snapshot_key: "main".to_string(),
            app_salt: "innkeep-offline-v1".to_string(),
            device_id: None,
            kdf_iterations: 100_000,
            high_priority_tables: vec!["invoices".to_string(), "invoice_items".to_string()],
            seed_defaults: true,
            event_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Load configuration, layering `path` (when given, it must exist) and
    /// the environment over the defaults.
    pub fn load(path: Option<&Path>) -> StoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("high_priority_tables"),
        );

        let config: StoreConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            db_path = %config.db_path.display(),
            snapshot_key = %config.snapshot_key,
            "Loaded store configuration"
        );
        Ok(config)
    }

    /// Configuration for a store under `dir`, otherwise default
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            db_path: dir.as_ref().join("innkeep_local.db"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.snapshot_key.trim().is_empty() {
            return Err(StoreError::Config("snapshot_key must not be empty".into()));
        }
        if self.app_salt.is_empty() {
            return Err(StoreError::Config("app_salt must not be empty".into()));
        }
        if self.kdf_iterations == 0 {
            return Err(StoreError::Config("kdf_iterations must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(StoreError::Config("event_capacity must be positive".into()));
        }
        if self.snapshot_key == crate::block_store::DEVICE_ID_KEY {
            return Err(StoreError::Config(format!(
                "snapshot_key collides with reserved key {}",
                crate::block_store::DEVICE_ID_KEY
            )));
        }
        Ok(())
    }
}
