//! Shared engine handle with write-through persistence

use crate::block_store::EncryptedBlockStore;
use crate::engine::Engine;
use crate::error::StoreResult;
use crate::events::StoreEvent;
use crate::outbox::OutboxPolicy;
use crate::value::now_timestamp;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

/// Outcome of the most recent snapshot write
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistStats {
    pub snapshots_written: u64,
    pub last_snapshot_bytes: usize,
    pub last_persisted_at: Option<String>,
}

/// Mutable view of the engine handed to a write operation. Events deferred
/// here are published only once the write has been persisted.
pub struct UnitOfWork<'a> {
    engine: &'a mut Engine,
    policy: &'a OutboxPolicy,
    events: Vec<StoreEvent>,
}

impl<'a> UnitOfWork<'a> {
    pub(crate) fn new(engine: &'a mut Engine, policy: &'a OutboxPolicy) -> Self {
        Self {
            engine,
            policy,
            events: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        self.engine
    }

    pub fn policy(&self) -> &OutboxPolicy {
        self.policy
    }

    pub fn defer_event(&mut self, event: StoreEvent) {
        self.events.push(event);
    }

    fn into_events(self) -> Vec<StoreEvent> {
        self.events
    }
}

pub struct StoreContext {
    engine: Mutex<Engine>,
    block_store: EncryptedBlockStore,
    snapshot_key: String,
    policy: OutboxPolicy,
    events: broadcast::Sender<StoreEvent>,
    stats: Mutex<PersistStats>,
}

impl StoreContext {
    pub fn new(
        engine: Engine,
        block_store: EncryptedBlockStore,
        snapshot_key: impl Into<String>,
        policy: OutboxPolicy,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            block_store,
            snapshot_key: snapshot_key.into(),
            policy,
            events,
            stats: Mutex::new(PersistStats::default()),
        }
    }

    /// Run a read-only closure against the committed engine state
    pub async fn read<T>(&self, f: impl FnOnce(&Engine) -> StoreResult<T>) -> StoreResult<T> {
        let engine = self.engine.lock().await;
        f(&engine)
    }

    /// Run `f` inside one engine transaction. The resulting state is sealed
    /// and written to the block store before the transaction commits; if
    /// either `f` or the write fails, the transaction is rolled back.
    pub async fn write<T>(
        &self,
        f: impl FnOnce(&mut UnitOfWork<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut engine = self.engine.lock().await;
        engine.begin()?;

        let outcome = {
            let mut uow = UnitOfWork::new(&mut engine, &self.policy);
            f(&mut uow).map(|value| (value, uow.into_events()))
        };
        let (value, events) = match outcome {
            Ok(done) => done,
            Err(err) => {
                Self::abort(&mut engine);
                return Err(err);
            }
        };

        // exported before awaiting: the engine is not Sync
        let snapshot = engine.export();
        let bytes = match snapshot {
            Ok(snapshot) => self.persist(snapshot).await,
            Err(err) => Err(err),
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "Snapshot write failed, rolling back");
                Self::abort(&mut engine);
                return Err(err);
            }
        };
        engine.commit()?;
        drop(engine);

        self.publish(events, bytes);
        Ok(value)
    }

    /// Run `f` with direct engine access, outside any enclosing transaction,
    /// and persist the result on success. Used by the migration runner,
    /// which manages its own transactions.
    pub async fn maintain<T>(&self, f: impl FnOnce(&mut Engine) -> StoreResult<T>) -> StoreResult<T> {
        let mut engine = self.engine.lock().await;
        let value = f(&mut engine)?;
        let snapshot = engine.export()?;
        let bytes = self.persist(snapshot).await?;
        drop(engine);

        self.publish(Vec::new(), bytes);
        Ok(value)
    }

    /// Write exported engine bytes (including any open transaction) through
    /// the block store
    async fn persist(&self, bytes: Vec<u8>) -> StoreResult<usize> {
        self.block_store.put(&self.snapshot_key, &bytes).await?;

        let mut stats = self.stats.lock().await;
        stats.snapshots_written += 1;
        stats.last_snapshot_bytes = bytes.len();
        stats.last_persisted_at = Some(now_timestamp());

        tracing::debug!(
            snapshot_key = %self.snapshot_key,
            bytes = bytes.len(),
            "Persisted snapshot"
        );
        Ok(bytes.len())
    }

    fn abort(engine: &mut Engine) {
        if let Err(err) = engine.rollback() {
            tracing::error!(error = %err, "Rollback failed");
        }
    }

    fn publish(&self, events: Vec<StoreEvent>, bytes: usize) {
        // no subscribers is not an error
        for event in events {
            let _ = self.events.send(event);
        }
        let _ = self.events.send(StoreEvent::SnapshotPersisted { bytes });
    }

    pub async fn persist_stats(&self) -> PersistStats {
        self.stats.lock().await.clone()
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn block_store(&self) -> &EncryptedBlockStore {
        &self.block_store
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Exported bytes of the committed state
    pub async fn export(&self) -> StoreResult<Vec<u8>> {
        self.read(Engine::export).await
    }
}
