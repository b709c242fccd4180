//! Pool Registry
//!
//! The lookup and lifecycle layer consumers call:
//! - Lazily materializes one [`EventSourcedStore`] per pool identifier
//! - Indexes pools by every token pair they can swap, so pair lookups never
//!   scan the whole registry
//! - Keeps polled pools fresh with one batched read per refresh tick (writer)
//!   or by installing snapshots the writer published to the shared cache
//!   (reader)

use crate::aggregator::BatchAggregator;
use crate::cache::{get_json, set_json, SharedCache};
use crate::events::{Address, DecodeError, EventLog};
use crate::fetcher::{FetchError, FetchHandler, FetchSource, Fetcher, FetcherConfig};
use crate::store::{EventSourcedStore, RebuildTicket, Snapshot, SyncStatus};
use crate::traits::{PoolStateSource, StateError};
use async_trait::async_trait;
use dashmap::DashMap;
use engine_config::{RegistrySettings, Role};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `{integration}_{address}_{is_meta}`, lowercased; immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolIdentifier(String);

impl PoolIdentifier {
    pub fn new(integration: &str, address: Address, is_meta: bool) -> Self {
        Self(
            format!(
                "{}_0x{}_{}",
                integration,
                hex::encode(address.as_bytes()),
                is_meta
            )
            .to_lowercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of [`ResourceRegistry::get_pool`]
pub enum PoolLookup<P: PoolStateSource> {
    /// Registered and able to serve the request
    Usable(Arc<EventSourcedStore<P>>),
    /// Registered but lacks a capability the caller requires
    Unusable(Arc<EventSourcedStore<P>>),
    NotFound,
}

impl<P: PoolStateSource> PoolLookup<P> {
    pub fn is_usable(&self) -> bool {
        matches!(self, PoolLookup::Usable(_))
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, PoolLookup::NotFound)
    }

    /// The store, only when usable
    pub fn usable(self) -> Option<Arc<EventSourcedStore<P>>> {
        match self {
            PoolLookup::Usable(store) => Some(store),
            _ => None,
        }
    }
}

impl<P: PoolStateSource> fmt::Debug for PoolLookup<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolLookup::Usable(store) => write!(f, "Usable({})", store.identifier()),
            PoolLookup::Unusable(store) => write!(f, "Unusable({})", store.identifier()),
            PoolLookup::NotFound => f.write_str("NotFound"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Pool {0} is already registered")]
    DuplicatePool(PoolIdentifier),

    #[error("Registry resources have been released")]
    Released,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Integration (dex) key; also the cache namespace
    pub integration: String,
    pub network: u64,
    pub role: Role,
    pub state_update_period: Duration,
    pub refresh_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(integration: impl Into<String>, network: u64, role: Role) -> Self {
        Self::from_settings(integration, network, role, &RegistrySettings::default())
    }

    pub fn from_settings(
        integration: impl Into<String>,
        network: u64,
        role: Role,
        settings: &RegistrySettings,
    ) -> Self {
        Self {
            integration: integration.into(),
            network,
            role,
            state_update_period: Duration::from_millis(settings.state_update_period_ms),
            refresh_timeout: Duration::from_millis(settings.refresh_timeout_ms),
        }
    }

    /// TTL of published snapshots: two refresh periods, so one missed tick
    /// never empties the cache
    pub fn snapshot_ttl_secs(&self) -> u64 {
        let ttl_ms = self.state_update_period.as_millis() as u64 * 2;
        ttl_ms.div_ceil(1_000).max(1)
    }
}

/// Snapshot as exchanged through the shared cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot<S> {
    pub block_number: u64,
    pub state: S,
}

pub type RefreshBatch<S> = Vec<(PoolIdentifier, Snapshot<S>)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pools: usize,
    pub pairs_indexed: usize,
    pub ready_pools: usize,
}

pub struct ResourceRegistry<P: PoolStateSource> {
    config: RegistryConfig,
    aggregator: Arc<BatchAggregator>,
    cache: Arc<dyn SharedCache>,
    pools: DashMap<PoolIdentifier, Arc<EventSourcedStore<P>>>,
    /// Sorted token pair -> pools able to swap it
    pair_index: DashMap<(Address, Address), Vec<PoolIdentifier>>,
    fetcher: Mutex<Option<Fetcher<RefreshBatch<P::State>>>>,
    released: AtomicBool,
}

fn pair_key(a: Address, b: Address) -> (Address, Address) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl<P: PoolStateSource> ResourceRegistry<P> {
    pub fn new(
        config: RegistryConfig,
        aggregator: Arc<BatchAggregator>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            config,
            aggregator,
            cache,
            pools: DashMap::new(),
            pair_index: DashMap::new(),
            fetcher: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn ensure_active(&self) -> Result<(), RegistryError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(RegistryError::Released);
        }
        Ok(())
    }

    fn index_pool(&self, id: &PoolIdentifier, tokens: &[Address]) {
        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i + 1..] {
                if a == b {
                    continue;
                }
                let mut pools = self.pair_index.entry(pair_key(*a, *b)).or_default();
                if !pools.contains(id) {
                    pools.push(id.clone());
                }
            }
        }
    }

    fn new_store(&self, id: &PoolIdentifier, source: P) -> Arc<EventSourcedStore<P>> {
        Arc::new(EventSourcedStore::new(
            id.as_str(),
            Arc::new(source),
            Arc::clone(&self.aggregator),
        ))
    }

    /// Register a pool; registering an identifier twice is an error
    pub fn initialize_new_pool(
        &self,
        id: PoolIdentifier,
        source: P,
    ) -> Result<Arc<EventSourcedStore<P>>, RegistryError> {
        self.ensure_active()?;

        let store = match self.pools.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::DuplicatePool(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let store = self.new_store(&id, source);
                slot.insert(Arc::clone(&store));
                store
            }
        };

        self.index_pool(&id, store.source().tokens());
        debug!(
            "Registered {} for {} tokens",
            id,
            store.source().tokens().len()
        );
        Ok(store)
    }

    /// Existing store for `id`, or a new one built from `make_source`.
    ///
    /// Concurrent callers for the same identifier all receive the same store.
    pub fn get_or_initialize_pool<F>(
        &self,
        id: PoolIdentifier,
        make_source: F,
    ) -> Result<Arc<EventSourcedStore<P>>, RegistryError>
    where
        F: FnOnce() -> P,
    {
        self.ensure_active()?;

        let mut created = false;
        let store = Arc::clone(
            self.pools
                .entry(id.clone())
                .or_insert_with(|| {
                    created = true;
                    self.new_store(&id, make_source())
                })
                .value(),
        );

        if created {
            self.index_pool(&id, store.source().tokens());
        }
        Ok(store)
    }

    /// Look a pool up, honoring a required fee-on-transfer capability
    pub fn get_pool(&self, id: &PoolIdentifier, fee_on_transfer_required: bool) -> PoolLookup<P> {
        let Some(store) = self.pools.get(id).map(|entry| Arc::clone(entry.value())) else {
            return PoolLookup::NotFound;
        };

        if fee_on_transfer_required && !store.source().supports_fee_on_transfer() {
            return PoolLookup::Unusable(store);
        }
        PoolLookup::Usable(store)
    }

    /// Every registered pool whose token set contains both tokens
    pub fn get_pools_for_pair(&self, token_a: Address, token_b: Address) -> Vec<Arc<EventSourcedStore<P>>> {
        if token_a == token_b {
            return Vec::new();
        }

        let ids = match self.pair_index.get(&pair_key(token_a, token_b)) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.pools.get(id).map(|entry| Arc::clone(entry.value())))
            .collect()
    }

    /// Pools for the pair that satisfy the fee-on-transfer requirement
    pub fn get_usable_pools_for_pair(
        &self,
        token_a: Address,
        token_b: Address,
        fee_on_transfer_required: bool,
    ) -> Vec<Arc<EventSourcedStore<P>>> {
        self.get_pools_for_pair(token_a, token_b)
            .into_iter()
            .filter(|store| !fee_on_transfer_required || store.source().supports_fee_on_transfer())
            .collect()
    }

    pub fn pool_ids(&self) -> Vec<PoolIdentifier> {
        let mut ids: Vec<PoolIdentifier> = self.pools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Fan a decoded log out to every pool it concerns.
    ///
    /// Returns how many snapshots advanced.
    pub fn apply_log(&self, log: &EventLog) -> usize {
        let stores: Vec<Arc<EventSourcedStore<P>>> = self
            .pools
            .iter()
            .filter(|entry| entry.value().source().is_relevant(log))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        stores
            .iter()
            .filter(|store| store.apply_log(log).is_some())
            .count()
    }

    /// Bring specific stores up to date right now.
    ///
    /// A writer rebuilds each store over RPC and republishes the result; a
    /// reader only installs what the writer published, and a cache miss
    /// leaves that entry `None` (unavailable).
    pub async fn update_manually_polling_pools(
        &self,
        stores: &[Arc<EventSourcedStore<P>>],
    ) -> Vec<Option<Snapshot<P::State>>> {
        match self.config.role {
            Role::Writer => {
                let rebuilt = join_all(stores.iter().map(|store| store.generate_state(None))).await;

                let mut snapshots = Vec::with_capacity(stores.len());
                for (store, result) in stores.iter().zip(rebuilt) {
                    match result {
                        Ok(snapshot) => {
                            self.publish(store.identifier(), &snapshot).await;
                            snapshots.push(Some(snapshot));
                        }
                        Err(e) => {
                            warn!("Manual update of {} failed: {}", store.identifier(), e);
                            snapshots.push(None);
                        }
                    }
                }
                snapshots
            }
            Role::Reader => {
                let mut snapshots = Vec::with_capacity(stores.len());
                for store in stores {
                    match self.read_cached(store.identifier()).await {
                        Some(cached) => {
                            store.install_snapshot(Snapshot::new(cached.block_number, cached.state));
                            snapshots.push(store.get_state());
                        }
                        None => snapshots.push(None),
                    }
                }
                snapshots
            }
        }
    }

    async fn publish(&self, identifier: &str, snapshot: &Snapshot<P::State>) {
        let cached = CachedSnapshot {
            block_number: snapshot.block_number,
            state: &*snapshot.state,
        };
        if let Err(e) = set_json(
            self.cache.as_ref(),
            &self.config.integration,
            self.config.network,
            identifier,
            self.config.snapshot_ttl_secs(),
            &cached,
        )
        .await
        {
            warn!("Failed to publish {}: {}", identifier, e);
        }
    }

    async fn read_cached(&self, identifier: &str) -> Option<CachedSnapshot<P::State>> {
        match get_json(
            self.cache.as_ref(),
            &self.config.integration,
            self.config.network,
            identifier,
        )
        .await
        {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Failed to read cached state of {}: {}", identifier, e);
                None
            }
        }
    }

    /// One batched read for every live pool, all at the same height.
    ///
    /// Every covered store is held in flight until its share is committed, so
    /// on-demand rebuilds wait for the batch; stores already rebuilding are
    /// left out. Pools whose outputs fail to decode are left out of the
    /// result.
    async fn rebuild_all(&self) -> Result<RefreshBatch<P::State>, FetchError> {
        let stores: Vec<(PoolIdentifier, Arc<EventSourcedStore<P>>)> = self
            .pools
            .iter()
            .filter(|entry| entry.value().status() != SyncStatus::Released)
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let tickets: Vec<(&PoolIdentifier, RebuildTicket<'_, P>)> = stores
            .iter()
            .filter_map(|(id, store)| store.try_begin_rebuild().map(|ticket| (id, ticket)))
            .collect();
        if tickets.len() < stores.len() {
            debug!(
                "{}: {} pools already rebuilding, left out of refresh",
                self.config.integration,
                stores.len() - tickets.len()
            );
        }
        if tickets.is_empty() {
            return Ok(Vec::new());
        }

        let mut calls = Vec::new();
        let mut counts = Vec::with_capacity(tickets.len());
        for (_, ticket) in &tickets {
            let pool_calls = ticket.store().source().on_chain_calls();
            counts.push(pool_calls.len());
            calls.extend(pool_calls);
        }

        let aggregated = self
            .aggregator
            .aggregate(&calls, None)
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        let block_number = aggregated.block_number;
        let mut values = aggregated.values.into_iter();

        let mut batch = Vec::with_capacity(tickets.len());
        for ((id, ticket), count) in tickets.into_iter().zip(counts) {
            // Consume exactly this pool's outputs before looking at them
            let outputs: Vec<Result<P::CallOutput, DecodeError>> = values.by_ref().take(count).collect();
            let snapshot = outputs
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| StateError::Decode {
                    identifier: id.to_string(),
                    source,
                })
                .and_then(|outputs| ticket.store().decode_snapshot(block_number, outputs));

            match ticket.complete(snapshot) {
                Ok(committed) => batch.push((id.clone(), committed)),
                Err(e) => warn!("Skipping {} in refresh at block {}: {}", id, block_number, e),
            }
        }

        debug!(
            "{}: rebuilt {} pools at block {}",
            self.config.integration,
            batch.len(),
            block_number
        );
        Ok(batch)
    }

    async fn read_all_cached(&self) -> RefreshBatch<P::State> {
        let mut batch = Vec::new();
        for id in self.pool_ids() {
            if let Some(cached) = self.read_cached(id.as_str()).await {
                batch.push((id, Snapshot::new(cached.block_number, cached.state)));
            }
        }
        batch
    }

    /// Writer: republish what the refresh committed. Reader: install what the
    /// writer published.
    async fn install_batch(&self, batch: RefreshBatch<P::State>) {
        for (id, snapshot) in batch {
            match self.config.role {
                Role::Writer => self.publish(id.as_str(), &snapshot).await,
                Role::Reader => {
                    if let Some(store) = self.pools.get(&id).map(|entry| Arc::clone(entry.value())) {
                        store.install_snapshot(snapshot);
                    }
                }
            }
        }
    }

    /// Start the background refresh for this registry's role; idempotent
    pub fn start_polling(self: &Arc<Self>) -> Result<(), RegistryError> {
        self.ensure_active()?;

        let mut fetcher = self.fetcher.lock();
        if let Some(fetcher) = fetcher.as_ref() {
            fetcher.start();
            return Ok(());
        }

        let config = FetcherConfig::new(
            format!("{}-{:?}-state", self.config.integration, self.config.role).to_lowercase(),
            self.config.state_update_period,
            self.config.refresh_timeout,
        )?;
        let refresh = Arc::new(RegistryRefresh {
            registry: Arc::downgrade(self),
        });

        let polling = Fetcher::new(config, refresh.clone(), refresh);
        polling.start();
        *fetcher = Some(polling);
        Ok(())
    }

    /// Stop polling and drop every store; safe to call more than once
    pub fn release_resources(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(fetcher) = self.fetcher.lock().take() {
            fetcher.stop();
        }

        let count = self.pools.len();
        for entry in self.pools.iter() {
            entry.value().release();
        }
        self.pools.clear();
        self.pair_index.clear();

        info!(
            "🛑 Released {} pools of {}",
            count, self.config.integration
        );
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            pools: self.pools.len(),
            pairs_indexed: self.pair_index.len(),
            ready_pools: self
                .pools
                .iter()
                .filter(|entry| entry.value().is_ready())
                .count(),
        }
    }
}

/// Refresh job of one registry: the source and the handler of its fetcher
struct RegistryRefresh<P: PoolStateSource> {
    registry: Weak<ResourceRegistry<P>>,
}

impl<P: PoolStateSource> RegistryRefresh<P> {
    fn registry(&self) -> Result<Arc<ResourceRegistry<P>>, FetchError> {
        self.registry
            .upgrade()
            .ok_or_else(|| FetchError::Request("registry dropped".to_string()))
    }
}

#[async_trait]
impl<P: PoolStateSource> FetchSource<RefreshBatch<P::State>> for RegistryRefresh<P> {
    async fn fetch(&self) -> Result<RefreshBatch<P::State>, FetchError> {
        let registry = self.registry()?;
        match registry.config.role {
            Role::Writer => registry.rebuild_all().await,
            Role::Reader => Ok(registry.read_all_cached().await),
        }
    }
}

#[async_trait]
impl<P: PoolStateSource> FetchHandler<RefreshBatch<P::State>> for RegistryRefresh<P> {
    async fn handle(&self, batch: RefreshBatch<P::State>) -> Result<(), FetchError> {
        self.registry()?.install_batch(batch).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::test_utils::{encode_uint, LedgerSource, ScriptedMulticall};

    fn token(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn registry(role: Role) -> ResourceRegistry<LedgerSource> {
        let transport = Arc::new(ScriptedMulticall::new(|_, _| Some(encode_uint(1))));
        let aggregator = Arc::new(BatchAggregator::new(transport, 50).unwrap());
        ResourceRegistry::new(
            RegistryConfig::new("Ledger", 1, role),
            aggregator,
            Arc::new(MemoryCache::new()),
        )
    }

    fn pool(registry: &ResourceRegistry<LedgerSource>, n: u8, tokens: &[u8]) -> PoolIdentifier {
        let id = PoolIdentifier::new("Ledger", Address::repeat_byte(n), false);
        let source = LedgerSource::new(
            Address::repeat_byte(n),
            tokens.iter().map(|t| token(*t)).collect(),
        );
        registry.initialize_new_pool(id.clone(), source).unwrap();
        id
    }

    #[test]
    fn test_identifier_is_lowercase() {
        let id = PoolIdentifier::new("SwaapV2", Address::repeat_byte(0xab), true);
        assert_eq!(
            id.as_str(),
            "swaapv2_0xabababababababababababababababababababab_true"
        );
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = registry(Role::Writer);
        let id = pool(&registry, 0xa1, &[1, 2]);

        let again = registry.initialize_new_pool(
            id.clone(),
            LedgerSource::new(Address::repeat_byte(0xa1), vec![token(3)]),
        );
        assert!(matches!(again, Err(RegistryError::DuplicatePool(dup)) if dup == id));

        // The original registration is untouched
        assert_eq!(registry.get_pools_for_pair(token(1), token(2)).len(), 1);
    }

    #[test]
    fn test_pair_index() {
        let registry = registry(Role::Writer);
        pool(&registry, 0xa1, &[1, 2, 3]);
        pool(&registry, 0xa2, &[2, 3]);

        assert_eq!(registry.get_pools_for_pair(token(1), token(2)).len(), 1);
        assert_eq!(registry.get_pools_for_pair(token(3), token(2)).len(), 2);
        assert!(registry.get_pools_for_pair(token(1), token(4)).is_empty());
        assert!(registry.get_pools_for_pair(token(2), token(2)).is_empty());
        assert_eq!(registry.stats().pairs_indexed, 3);
    }

    #[test]
    fn test_get_pool_tri_state() {
        let registry = registry(Role::Writer);
        let plain = pool(&registry, 0xa1, &[1, 2]);
        let fot = PoolIdentifier::new("Ledger", Address::repeat_byte(0xa2), false);
        registry
            .initialize_new_pool(
                fot.clone(),
                LedgerSource::new(Address::repeat_byte(0xa2), vec![token(1), token(2)])
                    .with_fee_on_transfer(),
            )
            .unwrap();

        assert!(registry.get_pool(&plain, false).is_usable());
        assert!(matches!(registry.get_pool(&plain, true), PoolLookup::Unusable(_)));
        assert!(registry.get_pool(&fot, true).is_usable());

        let missing = PoolIdentifier::new("Ledger", Address::repeat_byte(0xff), false);
        assert!(!registry.get_pool(&missing, false).is_found());

        assert_eq!(registry.get_usable_pools_for_pair(token(1), token(2), true).len(), 1);
        assert_eq!(registry.get_usable_pools_for_pair(token(1), token(2), false).len(), 2);
    }

    #[test]
    fn test_get_or_initialize_pool_reuses_store() {
        let registry = registry(Role::Writer);
        let id = PoolIdentifier::new("Ledger", Address::repeat_byte(0xa1), false);
        let make = || LedgerSource::new(Address::repeat_byte(0xa1), vec![token(1), token(2)]);

        let first = registry.get_or_initialize_pool(id.clone(), make).unwrap();
        let second = registry.get_or_initialize_pool(id, make).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.get_pools_for_pair(token(1), token(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_release_resources() {
        let registry = Arc::new(registry(Role::Writer));
        let id = pool(&registry, 0xa1, &[1, 2]);
        let store = registry.get_pool(&id, false).usable().unwrap();
        registry.start_polling().unwrap();

        registry.release_resources();
        registry.release_resources();

        assert_eq!(store.status(), SyncStatus::Released);
        assert!(!registry.get_pool(&id, false).is_found());
        assert!(registry.get_pools_for_pair(token(1), token(2)).is_empty());
        assert!(matches!(registry.start_polling(), Err(RegistryError::Released)));
        assert!(matches!(
            registry.initialize_new_pool(id, LedgerSource::new(Address::zero(), vec![])),
            Err(RegistryError::Released)
        ));
    }

    #[test]
    fn test_snapshot_ttl_exceeds_period() {
        let config = RegistryConfig::new("Ledger", 1, Role::Writer);
        assert_eq!(config.snapshot_ttl_secs(), 20);
    }
}
