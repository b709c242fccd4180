//! # Adapter Service
//!
//! Liquidity source integrations built on the `state-sync` engine.
//!
//! ## Integrations
//!
//! - [`verified`]: Verified primary and secondary issue pools. Event-sourced
//!   vault balances, rebuilt with batched `getPoolTokens` reads and advanced by
//!   vault `Swap` / `PoolBalanceChanged` logs.
//! - [`swaap_v2`]: Swaap V2 RFQ feed. Price levels and tokens polled into the
//!   shared cache by the writer instance, firm quotes on demand.
//!
//! ## Roles
//!
//! Every integration takes an explicit [`engine_config::Role`]. A writer polls
//! remote sources and publishes to the shared cache; a reader only serves
//! what the writer published and reports a miss as unavailable.

pub mod error;
pub mod swaap_v2;
pub mod verified;

pub use error::{AdapterError, Result};
pub use swaap_v2::SwaapV2RateFetcher;
pub use verified::{build_registry, VaultLogFeed, VerifiedPool, VerifiedRegistry};
