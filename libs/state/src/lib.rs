//! # State Sync
//!
//! Keeps the mutable state of many independent liquidity sources fresh
//! without each one issuing its own uncoordinated network traffic.
//!
//! ## Components
//!
//! - [`aggregator::BatchAggregator`]: size-bounded multicall batches with
//!   per-call success and decoding
//! - [`store::EventSourcedStore`]: one versioned snapshot per pool, advanced by
//!   replaying decoded logs and rebuilt (single-flight) on cold start or
//!   rollback
//! - [`fetcher::Fetcher`]: non-overlapping periodic fetch -> validate -> handle
//!   jobs, usually publishing into the shared TTL cache
//! - [`registry::ResourceRegistry`]: pool lookup by identifier and token pair,
//!   role-aware background refresh, teardown
//!
//! ## Usage
//!
//! ```rust,no_run
//! use state_sync::{BatchAggregator, MemoryCache, Web3Multicall};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Web3Multicall::new(
//!     "http://localhost:8545",
//!     "0x5ba1e12693dc8f9c48aad8770482f4739beed696".parse()?,
//!     Duration::from_secs(10),
//! )?;
//! let aggregator = Arc::new(BatchAggregator::new(Arc::new(transport), 500)?);
//! let cache = Arc::new(MemoryCache::new());
//! # let _ = (aggregator, cache);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod cache;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod multicall;
pub mod redis_cache;
pub mod registry;
pub mod store;
pub mod test_utils;
pub mod traits;

pub use aggregator::{
    Aggregated, AggregatorError, BatchAggregator, BatchCall, CallOutcome, MulticallTransport,
    RawCall, RawCallResult, TransportError,
};
pub use cache::{cache_key, get_json, set_json, CacheError, MemoryCache, SharedCache};
pub use events::{Address, DecodeError, EventLog};
pub use fetcher::{
    FetchError, FetchHandler, FetchSource, Fetcher, FetcherConfig, FetcherStats, HttpSource,
};
pub use http::{HttpError, HttpMethod, HttpRequest, HttpRequester, ReqwestRequester};
pub use multicall::Web3Multicall;
pub use redis_cache::RedisCache;
pub use registry::{
    CachedSnapshot, PoolIdentifier, PoolLookup, RegistryConfig, RegistryError, RegistryStats,
    ResourceRegistry,
};
pub use store::{
    classify_log, is_rollback, EventSourcedStore, LogOrdering, LogPosition, RebuildTicket, Snapshot,
    StoreStats, SyncStatus,
};
pub use traits::{EventHandlers, PoolStateSource, StateError};
