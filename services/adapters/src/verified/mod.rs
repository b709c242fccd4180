//! Verified integration
//!
//! Tracks Verified primary and secondary issue pools through their vault:
//! rebuilt with one `getPoolTokens` read per pool, advanced by vault logs.

pub mod abi;
pub mod log_feed;
pub mod pool;

pub use abi::decode_vault_log;
pub use log_feed::{LogBatch, LogProvider, VaultLogFeed, Web3LogProvider};
pub use pool::{parse_address, parse_pool_id, VerifiedPool, VerifiedPoolState, VerifiedPoolType};

use crate::error::{AdapterError, Result};
use engine_config::{RegistrySettings, Role, VerifiedSettings};
use state_sync::{
    BatchAggregator, PoolIdentifier, RegistryConfig, ResourceRegistry, SharedCache,
};
use std::sync::Arc;
use tracing::{info, warn};

pub type VerifiedRegistry = ResourceRegistry<VerifiedPool>;

/// Registry holding every configured pool of a supported type
pub fn build_registry(
    settings: &VerifiedSettings,
    network: u64,
    role: Role,
    registry_settings: &RegistrySettings,
    aggregator: Arc<BatchAggregator>,
    cache: Arc<dyn SharedCache>,
) -> Result<Arc<VerifiedRegistry>> {
    let registry = Arc::new(ResourceRegistry::new(
        RegistryConfig::from_settings(settings.dex_key.clone(), network, role, registry_settings),
        aggregator,
        cache,
    ));
    let registered = register_pools(&registry, settings)?;
    info!(
        "{} registry ready with {} pools ({:?})",
        settings.dex_key,
        registered.len(),
        role
    );
    Ok(registry)
}

/// Register the configured pools; unsupported pool types are skipped
pub fn register_pools(
    registry: &VerifiedRegistry,
    settings: &VerifiedSettings,
) -> Result<Vec<PoolIdentifier>> {
    let vault = parse_address("integrations.verified.vault_address", &settings.vault_address)?;

    let mut registered = Vec::with_capacity(settings.pools.len());
    for pool_settings in &settings.pools {
        let pool = match VerifiedPool::from_settings(vault, pool_settings) {
            Ok(pool) => pool,
            Err(AdapterError::UnsupportedPoolType(pool_type)) => {
                warn!("Skipping pool {} of unsupported type {}", pool_settings.id, pool_type);
                continue;
            }
            Err(e) => return Err(e),
        };

        let identifier = pool.identifier(&settings.dex_key);
        registry.initialize_new_pool(identifier.clone(), pool)?;
        registered.push(identifier);
    }
    Ok(registered)
}
