//! Swaap V2 integration
//!
//! Off-chain RFQ liquidity: price levels and the token list are polled into
//! the shared cache, firm quotes are requested per swap.

pub mod rate_fetcher;
pub mod types;

pub use rate_fetcher::{
    normalize_price_levels, normalize_token_address, normalize_tokens, SwaapV2RateFetcher,
};
pub use types::{
    OrderType, PairLevels, PriceLevel, PriceLevels, PriceLevelsResponse, QuoteParams,
    QuoteRequest, QuoteResponse, TokenInfo, TokensMap, TokensResponse,
};
