//! # Pool Sync Service
//!
//! Keeps every configured liquidity source fresh:
//! ```text
//! Vault logs ─┐
//!             ├→ Verified registry (event-sourced stores) ─→ shared cache
//! Multicall ──┘
//! Swaap API ───→ price levels / tokens fetchers ──────────→ shared cache
//! ```
//!
//! The instance role decides who talks to remote sources: a writer polls and
//! publishes, a reader only installs what the writer published.

use adapter_service::verified::{self, LogBatch, VaultLogFeed, Web3LogProvider};
use adapter_service::SwaapV2RateFetcher;
use anyhow::{Context, Result};
use clap::Parser;
use engine_config::{load_config, CacheBackend, EngineConfig, EngineSettings};
use state_sync::{
    BatchAggregator, Fetcher, FetcherConfig, MemoryCache, RedisCache, ReqwestRequester,
    SharedCache, Web3Multicall,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "pool_sync", about = "Pool state sync service")]
struct Args {
    /// Base configuration file
    #[arg(long, default_value = "config/engine.toml")]
    config: PathBuf,

    /// Environment override under `environments/`
    #[arg(long)]
    env: Option<String>,
}

fn init_tracing(settings: &EngineSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn aggregator(config: &EngineConfig) -> Result<Arc<BatchAggregator>> {
    let multicall_address = config
        .rpc
        .multicall_address
        .parse()
        .context("Invalid multicall address")?;
    let transport = Web3Multicall::new(
        &config.rpc.http_url,
        multicall_address,
        Duration::from_millis(config.rpc.request_timeout_ms),
    )
    .context("Failed to create multicall transport")?;
    Ok(Arc::new(
        BatchAggregator::new(Arc::new(transport), config.rpc.max_batch_size)
            .context("Invalid multicall batch size")?,
    ))
}

/// The configured shared cache, plus the in-process one when that is it
async fn shared_cache(config: &EngineConfig) -> Result<(Arc<dyn SharedCache>, Option<Arc<MemoryCache>>)> {
    match config.cache.backend {
        CacheBackend::Memory => {
            let memory = Arc::new(MemoryCache::new());
            Ok((memory.clone(), Some(memory)))
        }
        CacheBackend::Redis => {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .context("cache.redis_url is required for the redis backend")?;
            let redis = RedisCache::connect(url)
                .await
                .context("Failed to connect to the shared cache")?;
            Ok((Arc::new(redis), None))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(Some(args.config.clone()), args.env.as_deref())?;
    init_tracing(&config.engine);

    let network = config.engine.network;
    let role = config.engine.role;
    info!("🚀 Starting pool sync on network {} as {:?}", network, role);
    info!("📋 Configuration loaded from: {:?}", args.config);

    let (cache, memory_cache) = shared_cache(&config).await?;
    info!("🗄️ Shared cache backend: {:?}", config.cache.backend);
    let aggregator = aggregator(&config)?;

    let mut verified_registry = None;
    let mut log_fetcher = None;
    if let Some(settings) = &config.integrations.verified {
        let registry = verified::build_registry(
            settings,
            network,
            role,
            &config.registry,
            Arc::clone(&aggregator),
            Arc::clone(&cache),
        )?;
        registry.start_polling()?;

        if role.is_writer() {
            let provider = Web3LogProvider::new(
                &config.rpc.http_url,
                Duration::from_millis(config.rpc.request_timeout_ms),
            )?;
            let vault = verified::parse_address(
                "integrations.verified.vault_address",
                &settings.vault_address,
            )?;
            let feed = Arc::new(VaultLogFeed::new(Arc::new(provider), vault, &registry));
            let fetcher: Fetcher<LogBatch> = Fetcher::new(
                FetcherConfig::new(
                    format!("{}-vault-logs", settings.dex_key).to_lowercase(),
                    Duration::from_millis(config.registry.state_update_period_ms),
                    Duration::from_millis(config.registry.refresh_timeout_ms),
                )?,
                feed.clone(),
                feed,
            );
            fetcher.start();
            log_fetcher = Some(fetcher);
        }
        verified_registry = Some(registry);
    }

    let mut swaap = None;
    if let Some(settings) = &config.integrations.swaap_v2 {
        let requester = Arc::new(ReqwestRequester::new().context("Failed to create HTTP client")?);
        let fetcher = SwaapV2RateFetcher::new(
            settings.clone(),
            network,
            role,
            requester,
            Arc::clone(&cache),
        )?;
        fetcher.start();
        swaap = Some(fetcher);
    }

    if verified_registry.is_none() && swaap.is_none() {
        warn!("No integrations configured, nothing to sync");
    }

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("📡 Received Ctrl+C, shutting down...");
                break;
            }
            _ = stats.tick() => {
                let purged = memory_cache.as_ref().map_or(0, |cache| cache.purge_expired());
                if let Some(registry) = &verified_registry {
                    let s = registry.stats();
                    info!(
                        "📊 {}: {}/{} pools ready, {} pairs indexed",
                        registry.config().integration, s.ready_pools, s.pools, s.pairs_indexed
                    );
                }
                if let Some(fetcher) = &swaap {
                    let s = fetcher.prices_fetcher().stats();
                    info!("📊 Swaap prices: {} ok, {} failed", s.successes, s.failures);
                }
                if purged > 0 {
                    info!("🧹 Purged {} expired cache entries", purged);
                }
            }
        }
    }

    if let Some(fetcher) = &log_fetcher {
        fetcher.stop();
    }
    if let Some(fetcher) = &swaap {
        fetcher.stop();
    }
    if let Some(registry) = &verified_registry {
        registry.release_resources();
    }

    info!("✅ Pool sync stopped gracefully");
    Ok(())
}
