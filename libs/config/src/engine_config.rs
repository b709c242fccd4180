//! Engine Configuration Module
//!
//! Loads the engine configuration from a TOML file with optional
//! environment-specific overrides and `POOLSYNC__` environment variables.
//! Cross-field invariants are checked by [`EngineConfig::validate`] so a
//! miswired deployment fails at startup instead of mid-query.

use crate::defaults;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Whether this instance owns writes to the shared cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Polls remote sources and publishes results to the shared cache
    Writer,
    /// Only reads the shared cache; a miss means "unavailable"
    Reader,
}

impl Role {
    pub fn is_writer(&self) -> bool {
        matches!(self, Role::Writer)
    }
}

/// Main engine configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Process-wide settings
    pub engine: EngineSettings,

    /// Remote read endpoint
    pub rpc: RpcSettings,

    /// Pool registry refresh cadence
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Where snapshots and rates are shared between instances
    #[serde(default)]
    pub cache: CacheSettings,

    /// Per-integration settings
    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineSettings {
    /// Chain id used in cache keys
    pub network: u64,
    pub role: Role,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RpcSettings {
    pub http_url: String,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegistrySettings {
    pub state_update_period_ms: u64,
    pub refresh_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            state_update_period_ms: defaults::registry::STATE_UPDATE_PERIOD_MS,
            refresh_timeout_ms: defaults::registry::REFRESH_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process only; nothing is visible to other instances
    #[default]
    Memory,
    /// Redis server shared by the writer and its readers
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CacheSettings {
    #[serde(default)]
    pub backend: CacheBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IntegrationsConfig {
    pub verified: Option<VerifiedSettings>,
    pub swaap_v2: Option<SwaapV2Settings>,
}

/// Verified vault pools tracked through vault events
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VerifiedSettings {
    #[serde(default = "default_verified_dex_key")]
    pub dex_key: String,
    pub vault_address: String,
    #[serde(default)]
    pub pools: Vec<VerifiedPoolSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VerifiedPoolSettings {
    /// 32-byte vault pool id, hex encoded
    pub id: String,
    pub address: String,
    pub pool_type: String,
    pub tokens: Vec<String>,
}

/// Swaap V2 RFQ feed polled over HTTP
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SwaapV2Settings {
    #[serde(default = "default_swaap_dex_key")]
    pub dex_key: String,
    pub api_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_swaap_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_prices_interval_ms")]
    pub prices_interval_ms: u64,
    #[serde(default = "default_prices_cache_ttl_secs")]
    pub prices_cache_ttl_secs: u64,
    #[serde(default = "default_prices_cache_key")]
    pub prices_cache_key: String,

    #[serde(default = "default_tokens_interval_ms")]
    pub tokens_interval_ms: u64,
    #[serde(default = "default_tokens_cache_ttl_secs")]
    pub tokens_cache_ttl_secs: u64,
    #[serde(default = "default_tokens_cache_key")]
    pub tokens_cache_key: String,
}

/// Wiring errors detected before any component starts
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("{field}: timeout {timeout_ms}ms must be shorter than interval {interval_ms}ms")]
    TimeoutNotBelowInterval {
        field: String,
        timeout_ms: u64,
        interval_ms: u64,
    },

    #[error("{field}: cache TTL {ttl_secs}s must exceed polling interval {interval_ms}ms")]
    TtlNotAboveInterval {
        field: String,
        ttl_secs: u64,
        interval_ms: u64,
    },

    #[error("rpc.max_batch_size must be greater than zero")]
    ZeroBatchSize,

    #[error("A reader instance needs a shared cache backend, got {0:?}")]
    ReaderWithoutSharedCache(CacheBackend),
}

fn default_log_level() -> String {
    defaults::logging::LOG_LEVEL.to_string()
}
fn default_multicall_address() -> String {
    defaults::rpc::MULTICALL2_ADDRESS.to_string()
}
fn default_request_timeout_ms() -> u64 {
    defaults::rpc::REQUEST_TIMEOUT_MS
}
fn default_max_batch_size() -> usize {
    defaults::rpc::MAX_BATCH_SIZE
}
fn default_verified_dex_key() -> String {
    defaults::verified::DEX_KEY.to_string()
}
fn default_swaap_dex_key() -> String {
    defaults::swaap_v2::DEX_KEY.to_string()
}
fn default_swaap_request_timeout_ms() -> u64 {
    defaults::swaap_v2::REQUEST_TIMEOUT_MS
}
fn default_prices_interval_ms() -> u64 {
    defaults::swaap_v2::PRICES_INTERVAL_MS
}
fn default_prices_cache_ttl_secs() -> u64 {
    defaults::swaap_v2::PRICES_CACHE_TTL_SECS
}
fn default_prices_cache_key() -> String {
    defaults::swaap_v2::PRICES_CACHE_KEY.to_string()
}
fn default_tokens_interval_ms() -> u64 {
    defaults::swaap_v2::TOKENS_INTERVAL_MS
}
fn default_tokens_cache_ttl_secs() -> u64 {
    defaults::swaap_v2::TOKENS_CACHE_TTL_SECS
}
fn default_tokens_cache_key() -> String {
    defaults::swaap_v2::TOKENS_CACHE_KEY.to_string()
}

/// `0x` followed by 40 hex characters
pub fn is_address(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn check_address(field: &str, value: &str) -> Result<(), ConfigError> {
    if is_address(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

fn check_timeout(field: &str, timeout_ms: u64, interval_ms: u64) -> Result<(), ConfigError> {
    if timeout_ms < interval_ms {
        Ok(())
    } else {
        Err(ConfigError::TimeoutNotBelowInterval {
            field: field.to_string(),
            timeout_ms,
            interval_ms,
        })
    }
}

fn check_ttl(field: &str, ttl_secs: u64, interval_ms: u64) -> Result<(), ConfigError> {
    if ttl_secs.saturating_mul(1_000) > interval_ms {
        Ok(())
    } else {
        Err(ConfigError::TtlNotAboveInterval {
            field: field.to_string(),
            ttl_secs,
            interval_ms,
        })
    }
}

impl EngineConfig {
    /// Load configuration from files with environment overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/engine.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or(Path::new("config"))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (POOLSYNC__SECTION__KEY)
        builder = builder.add_source(
            Environment::with_prefix("POOLSYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Expand environment variables in URL and secret values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let expanded =
            shellexpand::env(&self.rpc.http_url).context("Failed to expand RPC URL")?;
        self.rpc.http_url = expanded.to_string();

        if let Some(url) = &self.cache.redis_url {
            let expanded = shellexpand::env(url).context("Failed to expand Redis URL")?;
            self.cache.redis_url = Some(expanded.to_string());
        }

        if let Some(swaap) = &mut self.integrations.swaap_v2 {
            let expanded =
                shellexpand::env(&swaap.api_url).context("Failed to expand Swaap API URL")?;
            swaap.api_url = expanded.to_string();

            if let Some(key) = &swaap.api_key {
                let expanded =
                    shellexpand::env(key).context("Failed to expand Swaap API key")?;
                swaap.api_key = Some(expanded.to_string());
            }
        }

        Ok(())
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.http_url.is_empty() {
            return Err(ConfigError::Missing("rpc.http_url".to_string()));
        }
        if self.rpc.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        check_address("rpc.multicall_address", &self.rpc.multicall_address)?;
        check_timeout(
            "registry",
            self.registry.refresh_timeout_ms,
            self.registry.state_update_period_ms,
        )?;

        match self.cache.backend {
            CacheBackend::Redis => {
                if self.cache.redis_url.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Missing("cache.redis_url".to_string()));
                }
            }
            CacheBackend::Memory => {
                // Readers only serve what a writer published elsewhere
                if self.engine.role == Role::Reader {
                    return Err(ConfigError::ReaderWithoutSharedCache(self.cache.backend));
                }
            }
        }

        if let Some(verified) = &self.integrations.verified {
            check_address("integrations.verified.vault_address", &verified.vault_address)?;
            for pool in &verified.pools {
                check_address("integrations.verified.pools.address", &pool.address)?;
                for token in &pool.tokens {
                    check_address("integrations.verified.pools.tokens", token)?;
                }
            }
        }

        if let Some(swaap) = &self.integrations.swaap_v2 {
            if swaap.api_url.is_empty() {
                return Err(ConfigError::Missing(
                    "integrations.swaap_v2.api_url".to_string(),
                ));
            }
            check_timeout(
                "integrations.swaap_v2.prices",
                swaap.request_timeout_ms,
                swaap.prices_interval_ms,
            )?;
            check_timeout(
                "integrations.swaap_v2.tokens",
                swaap.request_timeout_ms,
                swaap.tokens_interval_ms,
            )?;
            check_ttl(
                "integrations.swaap_v2.prices",
                swaap.prices_cache_ttl_secs,
                swaap.prices_interval_ms,
            )?;
            check_ttl(
                "integrations.swaap_v2.tokens",
                swaap.tokens_cache_ttl_secs,
                swaap.tokens_interval_ms,
            )?;
        }

        Ok(())
    }
}

/// Load, expand and validate in one step
pub fn load_config(path: Option<PathBuf>, environment: Option<&str>) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path.as_deref(), environment)?;
    config.expand_env_vars()?;
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}
