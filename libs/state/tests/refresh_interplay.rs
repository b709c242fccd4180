//! The writer's refresh tick, on-demand rebuilds and the log stream all touch
//! the same stores; none of them may undo or duplicate another's work.

use engine_config::{RegistrySettings, Role};
use state_sync::test_utils::{deposit_log, LedgerChain, LedgerSource, ScriptedMulticall};
use state_sync::{
    Address, BatchAggregator, MemoryCache, PoolIdentifier, RegistryConfig, ResourceRegistry,
    SharedCache, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;

const POOL: u8 = 0xa1;

fn token(n: u8) -> Address {
    Address::repeat_byte(n)
}

fn pool() -> Address {
    Address::repeat_byte(POOL)
}

fn chain() -> LedgerChain {
    let chain = LedgerChain::new();
    chain.set_balances(10, &[(token(1), 100), (token(2), 200)]);
    chain
}

fn slow(chain: &LedgerChain, head: u64) -> Arc<ScriptedMulticall> {
    let transport = Arc::new(chain.multicall().with_latency(|_| Duration::from_millis(300)));
    transport.set_head_block(head);
    transport
}

fn registry(
    role: Role,
    transport: Arc<ScriptedMulticall>,
    cache: Arc<dyn SharedCache>,
) -> (Arc<ResourceRegistry<LedgerSource>>, PoolIdentifier) {
    let aggregator = Arc::new(BatchAggregator::new(transport, 100).unwrap());
    let registry = Arc::new(ResourceRegistry::new(
        RegistryConfig::from_settings(
            "Ledger",
            1,
            role,
            &RegistrySettings {
                state_update_period_ms: 1_000,
                refresh_timeout_ms: 500,
            },
        ),
        aggregator,
        cache,
    ));
    let id = PoolIdentifier::new("Ledger", pool(), false);
    registry
        .initialize_new_pool(id.clone(), LedgerSource::new(pool(), vec![token(1), token(2)]))
        .unwrap();
    (registry, id)
}

#[tokio::test(start_paused = true)]
async fn test_refresh_ahead_of_log_stream_keeps_pool_ready() {
    let chain = chain();
    chain.set_balances(12, &[(token(1), 105), (token(2), 200)]);
    let transport = Arc::new(chain.multicall());
    transport.set_head_block(12);
    let (writer, id) = registry(Role::Writer, transport, Arc::new(MemoryCache::new()));
    let store = writer.get_pool(&id, false).usable().unwrap();

    writer.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.block_number(), Some(12));

    // The log stream is still delivering blocks the refresh already covers
    assert_eq!(writer.apply_log(&deposit_log(pool(), token(1), 5, 11, 0)), 0);
    assert_eq!(writer.apply_log(&deposit_log(pool(), token(2), 1, 12, 3)), 0);
    assert_eq!(store.status(), SyncStatus::Ready);
    assert_eq!(store.stats().rollbacks, 0);
    assert_eq!(store.get_state().unwrap().state.balances, vec![105, 200]);

    assert_eq!(writer.apply_log(&deposit_log(pool(), token(2), 7, 13, 0)), 1);
    assert_eq!(store.get_state().unwrap().state.balances, vec![105, 207]);

    writer.release_resources();
}

#[tokio::test(start_paused = true)]
async fn test_on_demand_rebuild_waits_for_refresh_tick() {
    let chain = chain();
    let transport = slow(&chain, 10);
    let (writer, id) = registry(Role::Writer, transport.clone(), Arc::new(MemoryCache::new()));
    let store = writer.get_pool(&id, false).usable().unwrap();

    writer.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.aggregate_calls(), 1);

    let snapshot = store.get_or_generate_state().await.unwrap();
    assert_eq!(snapshot.block_number, 10);
    assert_eq!(snapshot.state.balances, vec![100, 200]);
    assert_eq!(transport.aggregate_calls(), 1);
    assert_eq!(transport.max_in_flight(), 1);

    writer.release_resources();
}

#[tokio::test(start_paused = true)]
async fn test_refresh_tick_skips_store_already_rebuilding() {
    let chain = chain();
    let transport = slow(&chain, 10);
    let (writer, id) = registry(Role::Writer, transport.clone(), Arc::new(MemoryCache::new()));
    let store = writer.get_pool(&id, false).usable().unwrap();

    let rebuild = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.generate_state(None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    writer.start_polling().unwrap();
    let snapshot = rebuild.await.unwrap().unwrap();
    assert_eq!(snapshot.block_number, 10);
    assert_eq!(transport.aggregate_calls(), 1);
    assert_eq!(transport.max_in_flight(), 1);

    writer.release_resources();
}

#[tokio::test(start_paused = true)]
async fn test_rebuild_racing_log_keeps_newer_state() {
    let chain = chain();
    let transport = slow(&chain, 10);
    let (writer, id) = registry(Role::Writer, transport, Arc::new(MemoryCache::new()));
    let store = writer.get_pool(&id, false).usable().unwrap();
    store.generate_state(None).await.unwrap();

    let rebuild = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.generate_state(None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.apply_log(&deposit_log(pool(), token(1), 5, 11, 0)).unwrap();

    // The read finished at block 10, behind the applied log
    let snapshot = rebuild.await.unwrap().unwrap();
    assert_eq!(snapshot.block_number, 11);
    assert_eq!(snapshot.state.balances, vec![105, 200]);
    assert_eq!(store.block_number(), Some(11));
    assert_eq!(store.status(), SyncStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_tick_publishes_newer_applied_state() {
    let chain = chain();
    let transport = slow(&chain, 10);
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let (writer, id) = registry(Role::Writer, transport.clone(), cache.clone());
    let (reader, _) = registry(Role::Reader, transport, cache);
    let store = writer.get_pool(&id, false).usable().unwrap();
    store.generate_state(None).await.unwrap();

    writer.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.apply_log(&deposit_log(pool(), token(1), 5, 11, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(store.block_number(), Some(11));
    let reader_store = reader.get_pool(&id, false).usable().unwrap();
    let installed = reader.update_manually_polling_pools(&[reader_store]).await;
    let snapshot = installed[0].as_ref().unwrap();
    assert_eq!(snapshot.block_number, 11);
    assert_eq!(snapshot.state.balances, vec![105, 200]);

    writer.release_resources();
}
