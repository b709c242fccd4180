//! Swaap V2 API payloads

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Accepts both `"1.5"` and `1.5`
fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// One step of an order book side: `level` units available at `price`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(deserialize_with = "decimal")]
    pub level: f64,
    #[serde(deserialize_with = "decimal")]
    pub price: f64,
}

/// Levels of one pair as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairLevels {
    pub bids: Option<Vec<PriceLevel>>,
    pub asks: Option<Vec<PriceLevel>>,
}

/// `GET levels`: pair name `"{base}/{quote}"` to its levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevelsResponse {
    pub success: bool,
    #[serde(default)]
    pub levels: HashMap<String, PairLevels>,
}

/// Levels of one pair as published to the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevels {
    pub base: String,
    pub quote: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

/// Lowercased token address to token info
pub type TokensMap = HashMap<String, TokenInfo>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensResponse {
    pub success: bool,
    #[serde(default)]
    pub tokens: TokensMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Sell,
    Buy,
}

/// Caller side of a firm quote request
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteParams {
    pub token_in: String,
    pub token_out: String,
    /// Base-unit amount as a decimal string
    pub amount: String,
    pub side: OrderType,
    pub origin: String,
    pub recipient: String,
    pub tolerance: f64,
}

/// Body of `POST quote`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub network_id: u64,
    pub origin: String,
    pub sender: String,
    pub recipient: String,
    pub timestamp: u64,
    pub order_type: OrderType,
    pub token_in: String,
    pub token_out: String,
    pub amount: String,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub success: bool,
    pub id: String,
    pub calldata: String,
    pub router: String,
    pub expiration: u64,
    pub amount: String,
    pub guaranteed_price: f64,
    pub recipient: String,
}

fn check_side(pair: &str, side: &str, levels: &[PriceLevel]) -> Result<(), String> {
    for level in levels {
        if !level.level.is_finite() || !level.price.is_finite() || level.level < 0.0 || level.price < 0.0 {
            return Err(format!("{} {}: invalid level {:?}", pair, side, level));
        }
    }
    Ok(())
}

pub fn validate_price_levels(response: &PriceLevelsResponse) -> Result<(), String> {
    for (pair, levels) in &response.levels {
        if let Some(bids) = &levels.bids {
            check_side(pair, "bids", bids)?;
        }
        if let Some(asks) = &levels.asks {
            check_side(pair, "asks", asks)?;
        }
    }
    Ok(())
}

pub fn validate_tokens(response: &TokensResponse) -> Result<(), String> {
    match response.tokens.iter().find(|(_, info)| info.decimals > 36) {
        Some((address, info)) => Err(format!("{}: {} decimals", address, info.decimals)),
        None => Ok(()),
    }
}

pub fn validate_quote(response: &QuoteResponse) -> Result<(), String> {
    if !response.success {
        return Err(format!("quote {} was not successful", response.id));
    }
    if response.calldata.is_empty() || response.router.is_empty() {
        return Err(format!("quote {} has no calldata or router", response.id));
    }
    Ok(())
}
