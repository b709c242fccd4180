//! Swaap V2 rate fetcher
//!
//! Two polling jobs keep the RFQ price levels and the token list in the
//! shared cache. Only a writer instance runs them; readers serve whatever
//! the writer last published.

use super::types::{
    validate_price_levels, validate_quote, validate_tokens, PriceLevels, PriceLevelsResponse,
    QuoteParams, QuoteRequest, QuoteResponse, TokensMap, TokensResponse,
};
use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use engine_config::{defaults, Role, SwaapV2Settings};
use state_sync::{
    get_json, set_json, FetchError, FetchHandler, Fetcher, FetcherConfig, HttpRequest,
    HttpRequester, HttpSource, SharedCache,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use web3::types::U256;

pub fn normalize_token_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Cache form of a price-levels response; `None` when it was unsuccessful.
///
/// Pairs missing either side or with a malformed name are dropped.
pub fn normalize_price_levels(response: PriceLevelsResponse) -> Option<Vec<PriceLevels>> {
    if !response.success {
        return None;
    }

    let mut levels: Vec<PriceLevels> = response
        .levels
        .into_iter()
        .filter_map(|(pair_name, pair)| {
            let (bids, asks) = (pair.bids?, pair.asks?);
            let (base, quote) = pair_name.split_once('/')?;
            if base.is_empty() || quote.is_empty() {
                return None;
            }
            Some(PriceLevels {
                base: normalize_token_address(base),
                quote: normalize_token_address(quote),
                bids,
                asks,
            })
        })
        .collect();
    levels.sort_by(|a, b| (&a.base, &a.quote).cmp(&(&b.base, &b.quote)));
    Some(levels)
}

/// Cache form of a tokens response; `None` when it was unsuccessful
pub fn normalize_tokens(response: TokensResponse) -> Option<TokensMap> {
    if !response.success {
        return None;
    }
    Some(
        response
            .tokens
            .into_iter()
            .map(|(address, info)| (normalize_token_address(&address), info))
            .collect(),
    )
}

/// Where and for how long one job publishes its value
#[derive(Clone)]
struct CacheTarget {
    cache: Arc<dyn SharedCache>,
    dex_key: String,
    network: u64,
    key: String,
    ttl_secs: u64,
}

impl CacheTarget {
    async fn publish<T: serde::Serialize + Sync>(&self, value: &T) -> std::result::Result<(), FetchError> {
        set_json(
            self.cache.as_ref(),
            &self.dex_key,
            self.network,
            &self.key,
            self.ttl_secs,
            value,
        )
        .await?;
        Ok(())
    }

    async fn read<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        Ok(get_json(self.cache.as_ref(), &self.dex_key, self.network, &self.key).await?)
    }
}

struct PriceLevelsHandler {
    target: CacheTarget,
}

#[async_trait]
impl FetchHandler<PriceLevelsResponse> for PriceLevelsHandler {
    async fn handle(&self, response: PriceLevelsResponse) -> std::result::Result<(), FetchError> {
        let Some(levels) = normalize_price_levels(response) else {
            warn!("{}: unsuccessful price levels response", self.target.dex_key);
            return Ok(());
        };
        debug!("{}: publishing {} pairs", self.target.dex_key, levels.len());
        self.target.publish(&levels).await
    }
}

struct TokensHandler {
    target: CacheTarget,
}

#[async_trait]
impl FetchHandler<TokensResponse> for TokensHandler {
    async fn handle(&self, response: TokensResponse) -> std::result::Result<(), FetchError> {
        let Some(tokens) = normalize_tokens(response) else {
            warn!("{}: unsuccessful tokens response", self.target.dex_key);
            return Ok(());
        };
        debug!("{}: publishing {} tokens", self.target.dex_key, tokens.len());
        self.target.publish(&tokens).await
    }
}

pub struct SwaapV2RateFetcher {
    settings: SwaapV2Settings,
    network: u64,
    role: Role,
    requester: Arc<dyn HttpRequester>,
    prices: CacheTarget,
    tokens: CacheTarget,
    prices_fetcher: Fetcher<PriceLevelsResponse>,
    tokens_fetcher: Fetcher<TokensResponse>,
}

impl SwaapV2RateFetcher {
    pub fn new(
        settings: SwaapV2Settings,
        network: u64,
        role: Role,
        requester: Arc<dyn HttpRequester>,
        cache: Arc<dyn SharedCache>,
    ) -> Result<Self> {
        if settings.prices_cache_ttl_secs.saturating_mul(1_000) <= settings.prices_interval_ms
            || settings.tokens_cache_ttl_secs.saturating_mul(1_000) <= settings.tokens_interval_ms
        {
            return Err(AdapterError::Configuration(format!(
                "{}: cache TTLs must exceed their polling intervals",
                settings.dex_key
            )));
        }

        let timeout = Duration::from_millis(settings.request_timeout_ms);
        let target = |key: &str, ttl_secs: u64| CacheTarget {
            cache: Arc::clone(&cache),
            dex_key: settings.dex_key.clone(),
            network,
            key: key.to_string(),
            ttl_secs,
        };
        let prices = target(&settings.prices_cache_key, settings.prices_cache_ttl_secs);
        let tokens = target(&settings.tokens_cache_key, settings.tokens_cache_ttl_secs);

        let prices_request = with_api_key(
            HttpRequest::get(format!("{}/{}/levels", settings.api_url, network), timeout),
            &settings,
        );
        let prices_fetcher = Fetcher::new(
            FetcherConfig::new(
                format!("{}-prices", settings.dex_key).to_lowercase(),
                Duration::from_millis(settings.prices_interval_ms),
                timeout,
            )?,
            Arc::new(
                HttpSource::new(Arc::clone(&requester), prices_request)
                    .with_validator(validate_price_levels),
            ),
            Arc::new(PriceLevelsHandler {
                target: prices.clone(),
            }),
        );

        let tokens_request = with_api_key(
            HttpRequest::get(format!("{}/{}/tokens", settings.api_url, network), timeout),
            &settings,
        );
        let tokens_fetcher = Fetcher::new(
            FetcherConfig::new(
                format!("{}-tokens", settings.dex_key).to_lowercase(),
                Duration::from_millis(settings.tokens_interval_ms),
                timeout,
            )?,
            Arc::new(
                HttpSource::new(Arc::clone(&requester), tokens_request)
                    .with_validator(validate_tokens),
            ),
            Arc::new(TokensHandler {
                target: tokens.clone(),
            }),
        );

        Ok(Self {
            settings,
            network,
            role,
            requester,
            prices,
            tokens,
            prices_fetcher,
            tokens_fetcher,
        })
    }

    /// Start both polling jobs; readers never poll
    pub fn start(&self) {
        if !self.role.is_writer() {
            debug!("{}: reader role, not polling", self.settings.dex_key);
            return;
        }
        self.prices_fetcher.start();
        self.tokens_fetcher.start();
    }

    pub fn stop(&self) {
        self.prices_fetcher.stop();
        self.tokens_fetcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.prices_fetcher.is_running() || self.tokens_fetcher.is_running()
    }

    pub fn prices_fetcher(&self) -> &Fetcher<PriceLevelsResponse> {
        &self.prices_fetcher
    }

    pub fn tokens_fetcher(&self) -> &Fetcher<TokensResponse> {
        &self.tokens_fetcher
    }

    /// Latest published price levels.
    ///
    /// On a miss a writer fetches once and re-reads; a reader reports the
    /// levels as unavailable.
    pub async fn get_price_levels(&self) -> Result<Option<Vec<PriceLevels>>> {
        if let Some(levels) = self.prices.read().await? {
            return Ok(Some(levels));
        }
        if !self.role.is_writer() {
            return Ok(None);
        }
        if let Err(e) = self.prices_fetcher.run_once().await {
            warn!("{}: on-demand price levels fetch failed: {}", self.settings.dex_key, e);
            return Ok(None);
        }
        self.prices.read().await
    }

    /// Latest published token list; same miss policy as [`Self::get_price_levels`]
    pub async fn get_tokens(&self) -> Result<Option<TokensMap>> {
        if let Some(tokens) = self.tokens.read().await? {
            return Ok(Some(tokens));
        }
        if !self.role.is_writer() {
            return Ok(None);
        }
        if let Err(e) = self.tokens_fetcher.run_once().await {
            warn!("{}: on-demand tokens fetch failed: {}", self.settings.dex_key, e);
            return Ok(None);
        }
        self.tokens.read().await
    }

    /// Levels of one pair, matched case-insensitively
    pub async fn get_pair_levels(&self, base: &str, quote: &str) -> Result<Option<PriceLevels>> {
        let (base, quote) = (normalize_token_address(base), normalize_token_address(quote));
        Ok(self
            .get_price_levels()
            .await?
            .and_then(|levels| levels.into_iter().find(|l| l.base == base && l.quote == quote)))
    }

    /// Firm quote for one swap, requested on demand
    pub async fn get_quote(&self, params: &QuoteParams) -> Result<QuoteResponse> {
        let amount = U256::from_dec_str(&params.amount)
            .map_err(|_| AdapterError::InvalidQuote(format!("amount {:?}", params.amount)))?;
        if amount.is_zero() {
            return Err(AdapterError::InvalidQuote("amount must be non-zero".to_string()));
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let body = QuoteRequest {
            network_id: self.network,
            origin: params.origin.clone(),
            sender: params.recipient.clone(),
            recipient: params.recipient.clone(),
            timestamp,
            order_type: params.side,
            token_in: normalize_token_address(&params.token_in),
            token_out: normalize_token_address(&params.token_out),
            amount: params.amount.clone(),
            tolerance: params.tolerance,
        };

        let request = with_api_key(
            HttpRequest::post(
                format!("{}/{}/quote", self.settings.api_url, self.network),
                serde_json::to_value(&body)?,
                Duration::from_millis(defaults::swaap_v2::QUOTE_TIMEOUT_MS),
            ),
            &self.settings,
        );

        info!(
            "{}: quote request {} -> {} amount {}",
            self.settings.dex_key, body.token_in, body.token_out, body.amount
        );
        let raw = self.requester.request(&request).await?;
        let quote: QuoteResponse = serde_json::from_value(raw)?;
        validate_quote(&quote).map_err(AdapterError::InvalidResponse)?;
        info!(
            "{}: quote {} amount {} expires {}",
            self.settings.dex_key, quote.id, quote.amount, quote.expiration
        );
        Ok(quote)
    }
}

fn with_api_key(request: HttpRequest, settings: &SwaapV2Settings) -> HttpRequest {
    match &settings.api_key {
        Some(key) => request.with_header("x-api-key", key.clone()),
        None => request,
    }
}
