//! Fixtures shared by unit tests

use crate::block_store::{EncryptedBlockStore, KvBackend, MemoryKvBackend};
use crate::context::StoreContext;
use crate::engine::Engine;
use crate::migration::{Migration, MigrationRunner};
use crate::outbox::OutboxPolicy;
use crate::repository::RepositoryRegistry;
use crate::tables;
use std::sync::Arc;
use tokio::sync::broadcast;

pub(crate) const TEST_ITERATIONS: u32 = 1_000;

pub(crate) async fn context() -> Arc<StoreContext> {
    context_with(tables::default_migrations()).await
}

pub(crate) async fn context_with(migrations: Vec<Migration>) -> Arc<StoreContext> {
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
    let block_store =
        EncryptedBlockStore::open(backend, "test-device", "innkeep-test", TEST_ITERATIONS)
            .unwrap();
    let (events, _) = broadcast::channel(64);
    let ctx = Arc::new(StoreContext::new(
        Engine::new().unwrap(),
        block_store,
        "main",
        OutboxPolicy::default(),
        events,
    ));
    ctx.maintain(|engine| MigrationRunner::new(migrations).run(engine))
        .await
        .unwrap();
    ctx
}

pub(crate) async fn registry(ctx: &Arc<StoreContext>) -> RepositoryRegistry {
    let names = tables::all_tables().into_iter().map(|schema| schema.name);
    ctx.read(|engine| RepositoryRegistry::from_engine(ctx, engine, names))
        .await
        .unwrap()
}
