//! Engine defaults
//!
//! Default values shared by the configuration loader and the services that
//! build components without a config file (tests, tools).

/// Multicall defaults
pub mod rpc {
    /// Multicall2 deployment shared by most EVM networks
    pub const MULTICALL2_ADDRESS: &str = "0x5ba1e12693dc8f9c48aad8770482f4739beed696";

    /// Upper bound of calls per multicall round trip (block gas limit driven)
    pub const MAX_BATCH_SIZE: usize = 500;

    /// Per-request timeout (milliseconds)
    pub const REQUEST_TIMEOUT_MS: u64 = 10_000;
}

/// Registry refresh defaults
pub mod registry {
    /// How often polled pool state is refreshed (milliseconds)
    pub const STATE_UPDATE_PERIOD_MS: u64 = 10_000;

    /// Hard timeout for one refresh tick (milliseconds)
    pub const REFRESH_TIMEOUT_MS: u64 = 8_000;
}

/// Swaap V2 RFQ defaults
pub mod swaap_v2 {
    pub const DEX_KEY: &str = "SwaapV2";

    pub const PRICES_INTERVAL_MS: u64 = 2_000;
    pub const PRICES_CACHE_TTL_SECS: u64 = 10;
    pub const PRICES_CACHE_KEY: &str = "pricesLevels";

    pub const TOKENS_INTERVAL_MS: u64 = 60_000;
    pub const TOKENS_CACHE_TTL_SECS: u64 = 180;
    pub const TOKENS_CACHE_KEY: &str = "tokens";

    /// Must stay below the shortest polling interval
    pub const REQUEST_TIMEOUT_MS: u64 = 1_500;

    /// Firm quotes are requested on demand, outside any polling cadence
    pub const QUOTE_TIMEOUT_MS: u64 = 5_000;
}

/// Verified vault defaults
pub mod verified {
    pub const DEX_KEY: &str = "Verified";
}

/// Logging defaults
pub mod logging {
    pub const LOG_LEVEL: &str = "info";
}
