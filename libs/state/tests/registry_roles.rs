//! A writer registry publishes pool snapshots to the shared cache; a reader
//! registry only installs what the writer published.

use engine_config::{RegistrySettings, Role};
use state_sync::test_utils::{deposit_log, LedgerChain, LedgerSource, ScriptedMulticall};
use state_sync::{
    Address, BatchAggregator, MemoryCache, PoolIdentifier, RegistryConfig, ResourceRegistry,
    SharedCache, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn token(n: u8) -> Address {
    Address::repeat_byte(n)
}

fn settings() -> RegistrySettings {
    RegistrySettings {
        state_update_period_ms: 1_000,
        refresh_timeout_ms: 500,
    }
}

fn registry(
    role: Role,
    transport: Arc<ScriptedMulticall>,
    cache: Arc<dyn SharedCache>,
) -> Arc<ResourceRegistry<LedgerSource>> {
    let aggregator = Arc::new(BatchAggregator::new(transport, 100).unwrap());
    Arc::new(ResourceRegistry::new(
        RegistryConfig::from_settings("Ledger", 1, role, &settings()),
        aggregator,
        cache,
    ))
}

fn register(registry: &ResourceRegistry<LedgerSource>, n: u8) -> PoolIdentifier {
    let id = PoolIdentifier::new("Ledger", Address::repeat_byte(n), false);
    registry
        .initialize_new_pool(
            id.clone(),
            LedgerSource::new(Address::repeat_byte(n), vec![token(1), token(2)]),
        )
        .unwrap();
    id
}

fn chain() -> LedgerChain {
    let chain = LedgerChain::new();
    chain.set_balances(10, &[(token(1), 100), (token(2), 200)]);
    chain
}

#[tokio::test(start_paused = true)]
async fn test_reader_miss_is_unavailable_until_writer_publishes() {
    let chain = chain();
    let transport = Arc::new(chain.multicall());
    transport.set_head_block(10);
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());

    let writer = registry(Role::Writer, transport.clone(), cache.clone());
    let reader = registry(Role::Reader, transport.clone(), cache);
    let id = register(&writer, 0xa1);
    register(&reader, 0xa1);

    let reader_store = reader.get_pool(&id, false).usable().unwrap();
    let writer_store = writer.get_pool(&id, false).usable().unwrap();

    let missing = reader.update_manually_polling_pools(&[reader_store.clone()]).await;
    assert!(missing[0].is_none());
    assert_eq!(transport.aggregate_calls(), 0);

    let published = writer.update_manually_polling_pools(&[writer_store]).await;
    assert_eq!(published[0].as_ref().unwrap().block_number, 10);
    assert_eq!(transport.aggregate_calls(), 1);

    let installed = reader.update_manually_polling_pools(&[reader_store.clone()]).await;
    let snapshot = installed[0].as_ref().unwrap();
    assert_eq!(snapshot.block_number, 10);
    assert_eq!(snapshot.state.balances, vec![100, 200]);
    assert_eq!(reader_store.status(), SyncStatus::Ready);

    // The reader never reads the chain itself
    assert_eq!(transport.aggregate_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_polling_keeps_reader_in_step_with_writer() {
    let chain = chain();
    let transport = Arc::new(chain.multicall());
    transport.set_head_block(10);
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());

    let writer = registry(Role::Writer, transport.clone(), cache.clone());
    let reader = registry(Role::Reader, transport.clone(), cache);
    let ids: Vec<PoolIdentifier> = [0xa1, 0xa2, 0xa3].iter().map(|n| register(&writer, *n)).collect();
    for n in [0xa1, 0xa2, 0xa3] {
        register(&reader, n);
    }

    writer.start_polling().unwrap();
    reader.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(writer.stats().ready_pools, 3);
    assert_eq!(reader.stats().ready_pools, 3);
    // One batched read per writer tick, covering every pool
    assert!(transport.batch_sizes().iter().all(|size| *size == 6));

    chain.set_balances(20, &[(token(1), 150), (token(2), 250)]);
    transport.set_head_block(20);
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    for id in &ids {
        let snapshot = reader.get_pool(id, false).usable().unwrap().get_state().unwrap();
        assert_eq!(snapshot.block_number, 20);
        assert_eq!(snapshot.state.balances, vec![150, 250]);
    }

    writer.release_resources();
    reader.release_resources();
    let calls = transport.aggregate_calls();
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(transport.aggregate_calls(), calls);
}

#[tokio::test]
async fn test_apply_log_fans_out_to_relevant_pools() {
    let chain = chain();
    let transport = Arc::new(chain.multicall());
    transport.set_head_block(10);
    let writer = registry(Role::Writer, transport, Arc::new(MemoryCache::new()));

    let a = register(&writer, 0xa1);
    let b = register(&writer, 0xa2);
    let stores = vec![
        writer.get_pool(&a, false).usable().unwrap(),
        writer.get_pool(&b, false).usable().unwrap(),
    ];
    writer.update_manually_polling_pools(&stores).await;

    let log = deposit_log(Address::repeat_byte(0xa2), token(1), 5, 11, 0);
    assert_eq!(writer.apply_log(&log), 1);

    assert_eq!(stores[0].get_state().unwrap().state.balances, vec![100, 200]);
    assert_eq!(stores[1].get_state().unwrap().state.balances, vec![105, 200]);
}
