//! # Engine Configuration
//!
//! Centralized configuration and defaults for the pool state sync engine.
//!
//! ## Features
//!
//! - **Layered loading**: base TOML, per-environment overrides, `POOLSYNC__` env vars
//! - **Explicit roles**: writer vs reader is configuration, never inferred
//! - **Fail-fast validation**: timeouts, TTLs and addresses checked at startup
//!
//! ## Usage
//!
//! ```rust,no_run
//! use engine_config::load_config;
//!
//! let config = load_config(None, Some("reader")).expect("valid config");
//! println!("network {} as {:?}", config.engine.network, config.engine.role);
//! ```

pub mod defaults;
pub mod engine_config;

// Re-export commonly used types
pub use engine_config::{
    is_address, load_config, CacheBackend, CacheSettings, ConfigError, EngineConfig,
    EngineSettings, IntegrationsConfig, RegistrySettings, Role, RpcSettings, SwaapV2Settings,
    VerifiedPoolSettings, VerifiedSettings,
};
