//! Verified vault pools
//!
//! Every Verified pool keeps its balances in the shared vault, so a pool's
//! full state is one `getPoolTokens` read and every balance change arrives as
//! a vault `Swap` or `PoolBalanceChanged` log tagged with the pool id.

use super::abi::{decode_get_pool_tokens, encode_get_pool_tokens, PoolTokens};
use crate::error::{AdapterError, Result};
use engine_config::{is_address, VerifiedPoolSettings};
use serde::{Deserialize, Serialize};
use state_sync::{Address, BatchCall, DecodeError, EventHandlers, EventLog, PoolIdentifier, PoolStateSource};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedPoolType {
    PrimaryIssue,
    SecondaryIssue,
}

impl FromStr for VerifiedPoolType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PrimaryIssuePool" => Ok(VerifiedPoolType::PrimaryIssue),
            "SecondaryIssuePool" => Ok(VerifiedPoolType::SecondaryIssue),
            other => Err(AdapterError::UnsupportedPoolType(other.to_string())),
        }
    }
}

impl fmt::Display for VerifiedPoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifiedPoolType::PrimaryIssue => f.write_str("PrimaryIssuePool"),
            VerifiedPoolType::SecondaryIssue => f.write_str("SecondaryIssuePool"),
        }
    }
}

/// Vault balances of one pool, in the pool's configured token order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPoolState {
    pub balances: Vec<u128>,
    pub last_change_block: u64,
}

pub fn parse_address(field: &str, value: &str) -> Result<Address> {
    if !is_address(value) {
        return Err(AdapterError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| AdapterError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// 32-byte vault pool id from `0x`-prefixed hex
pub fn parse_pool_id(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|_| AdapterError::InvalidPoolId(value.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| AdapterError::InvalidPoolId(value.to_string()))
}

pub struct VerifiedPool {
    vault: Address,
    pool_id: [u8; 32],
    address: Address,
    pool_type: VerifiedPoolType,
    tokens: Vec<Address>,
    get_pool_tokens_call: Vec<u8>,
}

impl VerifiedPool {
    pub fn new(
        vault: Address,
        pool_id: [u8; 32],
        address: Address,
        pool_type: VerifiedPoolType,
        tokens: Vec<Address>,
    ) -> Result<Self> {
        if tokens.len() < 2 {
            return Err(AdapterError::Configuration(format!(
                "pool 0x{} needs at least two tokens",
                hex::encode(pool_id)
            )));
        }
        Ok(Self {
            vault,
            pool_id,
            address,
            pool_type,
            tokens,
            get_pool_tokens_call: encode_get_pool_tokens(&pool_id)?,
        })
    }

    pub fn from_settings(vault: Address, settings: &VerifiedPoolSettings) -> Result<Self> {
        let pool_type: VerifiedPoolType = settings.pool_type.parse()?;
        let tokens = settings
            .tokens
            .iter()
            .map(|t| parse_address("pools.tokens", t))
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            vault,
            parse_pool_id(&settings.id)?,
            parse_address("pools.address", &settings.address)?,
            pool_type,
            tokens,
        )
    }

    pub fn identifier(&self, dex_key: &str) -> PoolIdentifier {
        PoolIdentifier::new(dex_key, self.address, false)
    }

    pub fn pool_id(&self) -> &[u8; 32] {
        &self.pool_id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pool_type(&self) -> VerifiedPoolType {
        self.pool_type
    }
}

fn token_index(tokens: &[Address], token: Address) -> std::result::Result<usize, DecodeError> {
    tokens
        .iter()
        .position(|t| *t == token)
        .ok_or(DecodeError::UnknownToken(token))
}

fn overflow(what: &str) -> DecodeError {
    DecodeError::InvalidPayload(format!("balance {}", what))
}

fn apply_swap(
    tokens: &[Address],
    state: &mut VerifiedPoolState,
    log: &EventLog,
) -> std::result::Result<(), DecodeError> {
    let token_in = token_index(tokens, log.address_param("tokenIn")?)?;
    let token_out = token_index(tokens, log.address_param("tokenOut")?)?;
    let amount_in = log.uint_param("amountIn")?;
    let amount_out = log.uint_param("amountOut")?;

    state.balances[token_in] = state.balances[token_in]
        .checked_add(amount_in)
        .ok_or_else(|| overflow("overflow"))?;
    state.balances[token_out] = state.balances[token_out]
        .checked_sub(amount_out)
        .ok_or_else(|| overflow("underflow"))?;
    state.last_change_block = log.block_number;
    Ok(())
}

fn apply_balance_change(
    tokens: &[Address],
    state: &mut VerifiedPoolState,
    log: &EventLog,
) -> std::result::Result<(), DecodeError> {
    let changed = log.address_array_param("tokens")?;
    let deltas = log.int_array_param("deltas")?;
    let fees = log.uint_array_param("protocolFeeAmounts")?;
    if changed.len() != deltas.len() || changed.len() != fees.len() {
        return Err(DecodeError::InvalidPayload(format!(
            "{} tokens, {} deltas, {} fees",
            changed.len(),
            deltas.len(),
            fees.len()
        )));
    }

    for ((token, delta), fee) in changed.into_iter().zip(deltas).zip(fees) {
        let index = token_index(tokens, token)?;
        let fee = i128::try_from(fee).map_err(|_| overflow("overflow"))?;
        let diff = delta.checked_sub(fee).ok_or_else(|| overflow("overflow"))?;

        let balance = &mut state.balances[index];
        *balance = if diff >= 0 {
            balance.checked_add(diff.unsigned_abs())
        } else {
            balance.checked_sub(diff.unsigned_abs())
        }
        .ok_or_else(|| overflow("out of range"))?;
    }
    state.last_change_block = log.block_number;
    Ok(())
}

impl PoolStateSource for VerifiedPool {
    type State = VerifiedPoolState;
    type CallOutput = PoolTokens;

    fn tokens(&self) -> &[Address] {
        &self.tokens
    }

    fn is_relevant(&self, log: &EventLog) -> bool {
        log.address == self.vault
            && log
                .fixed_bytes_param("poolId")
                .map(|id| id.as_slice() == self.pool_id.as_slice())
                .unwrap_or(false)
    }

    fn on_chain_calls(&self) -> Vec<BatchCall<PoolTokens>> {
        vec![BatchCall::new(
            self.vault,
            self.get_pool_tokens_call.clone(),
            decode_get_pool_tokens,
        )]
    }

    fn decode_on_chain_calls(
        &self,
        outputs: Vec<PoolTokens>,
    ) -> std::result::Result<VerifiedPoolState, DecodeError> {
        let [output]: [PoolTokens; 1] = outputs.try_into().map_err(|o: Vec<PoolTokens>| {
            DecodeError::InvalidPayload(format!("expected 1 getPoolTokens result, got {}", o.len()))
        })?;

        let balances = self
            .tokens
            .iter()
            .map(|token| {
                output
                    .tokens
                    .iter()
                    .position(|t| t == token)
                    .map(|i| output.balances[i])
                    .ok_or(DecodeError::UnknownToken(*token))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(VerifiedPoolState {
            balances,
            last_change_block: output.last_change_block,
        })
    }

    fn register_handlers(&self, handlers: &mut EventHandlers<VerifiedPoolState>) {
        let tokens = self.tokens.clone();
        handlers.register("Swap", move |state, log| apply_swap(&tokens, state, log));

        let tokens = self.tokens.clone();
        handlers.register("PoolBalanceChanged", move |state, log| {
            apply_balance_change(&tokens, state, log)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethabi::{LogParam, Token};
    use web3::types::U256;

    const VAULT: u8 = 0xba;
    const POOL_ID: [u8; 32] = [0x11; 32];

    fn token(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn pool() -> VerifiedPool {
        VerifiedPool::new(
            Address::repeat_byte(VAULT),
            POOL_ID,
            Address::repeat_byte(0x11),
            VerifiedPoolType::PrimaryIssue,
            vec![token(1), token(2)],
        )
        .unwrap()
    }

    fn param(name: &str, value: Token) -> LogParam {
        LogParam {
            name: name.to_string(),
            value,
        }
    }

    fn int(value: i128) -> Token {
        let magnitude = U256::from(value.unsigned_abs());
        if value >= 0 {
            Token::Int(magnitude)
        } else {
            Token::Int((!magnitude).overflowing_add(U256::one()).0)
        }
    }

    fn swap(token_in: u8, token_out: u8, amount_in: u64, amount_out: u64) -> EventLog {
        EventLog::new(
            Address::repeat_byte(VAULT),
            "Swap",
            vec![
                param("poolId", Token::FixedBytes(POOL_ID.to_vec())),
                param("tokenIn", Token::Address(token(token_in))),
                param("tokenOut", Token::Address(token(token_out))),
                param("amountIn", Token::Uint(U256::from(amount_in))),
                param("amountOut", Token::Uint(U256::from(amount_out))),
            ],
            10,
            0,
        )
    }

    fn state() -> VerifiedPoolState {
        VerifiedPoolState {
            balances: vec![1_000, 2_000],
            last_change_block: 5,
        }
    }

    fn handlers() -> EventHandlers<VerifiedPoolState> {
        let mut handlers = EventHandlers::new();
        pool().register_handlers(&mut handlers);
        handlers
    }

    #[test]
    fn test_pool_type_parsing() {
        assert_eq!("PrimaryIssuePool".parse::<VerifiedPoolType>().unwrap(), VerifiedPoolType::PrimaryIssue);
        assert_eq!(
            "SecondaryIssuePool".parse::<VerifiedPoolType>().unwrap().to_string(),
            "SecondaryIssuePool"
        );
        assert!(matches!(
            "Weighted".parse::<VerifiedPoolType>(),
            Err(AdapterError::UnsupportedPoolType(_))
        ));
    }

    #[test]
    fn test_identifier_format() {
        assert_eq!(
            pool().identifier("Verified").as_str(),
            "verified_0x1111111111111111111111111111111111111111_false"
        );
    }

    #[test]
    fn test_relevance_requires_vault_and_pool_id() {
        let pool = pool();
        assert!(pool.is_relevant(&swap(1, 2, 1, 1)));

        let mut other_pool = swap(1, 2, 1, 1);
        other_pool.params[0] = param("poolId", Token::FixedBytes(vec![0x22; 32]));
        assert!(!pool.is_relevant(&other_pool));

        let mut other_emitter = swap(1, 2, 1, 1);
        other_emitter.address = Address::repeat_byte(0xcc);
        assert!(!pool.is_relevant(&other_emitter));
    }

    #[test]
    fn test_swap_moves_both_balances() {
        let handlers = handlers();
        let mut state = state();
        (handlers.get("Swap").unwrap())(&mut state, &swap(1, 2, 100, 150)).unwrap();
        assert_eq!(state.balances, vec![1_100, 1_850]);
        assert_eq!(state.last_change_block, 10);
    }

    #[test]
    fn test_swap_rejects_unknown_token_and_underflow() {
        let handlers = handlers();
        let handler = handlers.get("Swap").unwrap();

        let mut state = state();
        assert_eq!(
            handler(&mut state, &swap(9, 2, 1, 1)),
            Err(DecodeError::UnknownToken(token(9)))
        );
        assert!(handler(&mut state, &swap(1, 2, 1, 5_000)).is_err());
    }

    #[test]
    fn test_balance_change_nets_protocol_fees() {
        let handlers = handlers();
        let log = EventLog::new(
            Address::repeat_byte(VAULT),
            "PoolBalanceChanged",
            vec![
                param("poolId", Token::FixedBytes(POOL_ID.to_vec())),
                param("liquidityProvider", Token::Address(token(7))),
                param(
                    "tokens",
                    Token::Array(vec![Token::Address(token(1)), Token::Address(token(2))]),
                ),
                param("deltas", Token::Array(vec![int(500), int(-300)])),
                param(
                    "protocolFeeAmounts",
                    Token::Array(vec![Token::Uint(U256::from(10u64)), Token::Uint(U256::from(20u64))]),
                ),
            ],
            12,
            3,
        );

        let mut state = state();
        (handlers.get("PoolBalanceChanged").unwrap())(&mut state, &log).unwrap();
        assert_eq!(state.balances, vec![1_490, 1_680]);
        assert_eq!(state.last_change_block, 12);
    }

    #[test]
    fn test_decode_reorders_vault_tokens() {
        let state = pool()
            .decode_on_chain_calls(vec![PoolTokens {
                tokens: vec![token(2), token(1)],
                balances: vec![20, 10],
                last_change_block: 3,
            }])
            .unwrap();
        assert_eq!(state.balances, vec![10, 20]);

        let missing = pool().decode_on_chain_calls(vec![PoolTokens {
            tokens: vec![token(1), token(3)],
            balances: vec![10, 30],
            last_change_block: 3,
        }]);
        assert_eq!(missing, Err(DecodeError::UnknownToken(token(2))));
    }

    #[test]
    fn test_from_settings_validates_inputs() {
        let settings = VerifiedPoolSettings {
            id: format!("0x{}", hex::encode(POOL_ID)),
            address: "0x1111111111111111111111111111111111111111".to_string(),
            pool_type: "SecondaryIssuePool".to_string(),
            tokens: vec![
                "0x0101010101010101010101010101010101010101".to_string(),
                "0x0202020202020202020202020202020202020202".to_string(),
            ],
        };
        let pool = VerifiedPool::from_settings(Address::repeat_byte(VAULT), &settings).unwrap();
        assert_eq!(pool.pool_type(), VerifiedPoolType::SecondaryIssue);
        assert_eq!(pool.tokens(), &[token(1), token(2)]);

        let mut short_id = settings.clone();
        short_id.id = "0x1234".to_string();
        assert!(matches!(
            VerifiedPool::from_settings(Address::repeat_byte(VAULT), &short_id),
            Err(AdapterError::InvalidPoolId(_))
        ));
    }
}
