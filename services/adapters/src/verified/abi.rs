//! Verified vault ABI
//!
//! Event and function definitions for the vault contract every Verified
//! pool settles through, plus the log-decoding step that turns raw vault logs
//! into [`EventLog`]s the state store can route by event name.

use ethabi::{Event, EventParam, Function, Param, ParamType, RawLog, StateMutability, Token};
use once_cell::sync::Lazy;
use state_sync::events::{abi_decode, token_to_address, token_to_u128};
use state_sync::{Address, DecodeError, EventLog};
use web3::types::{Log, H256, U256};

/// event Swap(bytes32 indexed poolId, address indexed tokenIn, address indexed tokenOut, uint256 amountIn, uint256 amountOut)
pub static SWAP_EVENT: Lazy<Event> = Lazy::new(|| Event {
    name: "Swap".to_string(),
    inputs: vec![
        EventParam {
            name: "poolId".to_string(),
            kind: ParamType::FixedBytes(32),
            indexed: true,
        },
        EventParam {
            name: "tokenIn".to_string(),
            kind: ParamType::Address,
            indexed: true,
        },
        EventParam {
            name: "tokenOut".to_string(),
            kind: ParamType::Address,
            indexed: true,
        },
        EventParam {
            name: "amountIn".to_string(),
            kind: ParamType::Uint(256),
            indexed: false,
        },
        EventParam {
            name: "amountOut".to_string(),
            kind: ParamType::Uint(256),
            indexed: false,
        },
    ],
    anonymous: false,
});

/// event PoolBalanceChanged(bytes32 indexed poolId, address indexed liquidityProvider, address[] tokens, int256[] deltas, uint256[] protocolFeeAmounts)
pub static POOL_BALANCE_CHANGED_EVENT: Lazy<Event> = Lazy::new(|| Event {
    name: "PoolBalanceChanged".to_string(),
    inputs: vec![
        EventParam {
            name: "poolId".to_string(),
            kind: ParamType::FixedBytes(32),
            indexed: true,
        },
        EventParam {
            name: "liquidityProvider".to_string(),
            kind: ParamType::Address,
            indexed: true,
        },
        EventParam {
            name: "tokens".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Address)),
            indexed: false,
        },
        EventParam {
            name: "deltas".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Int(256))),
            indexed: false,
        },
        EventParam {
            name: "protocolFeeAmounts".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Uint(256))),
            indexed: false,
        },
    ],
    anonymous: false,
});

fn param(name: &str, kind: ParamType) -> Param {
    Param {
        name: name.to_string(),
        kind,
        internal_type: None,
    }
}

/// function getPoolTokens(bytes32 poolId) view returns (address[] tokens, uint256[] balances, uint256 lastChangeBlock)
#[allow(deprecated)]
pub static GET_POOL_TOKENS: Lazy<Function> = Lazy::new(|| Function {
    name: "getPoolTokens".to_string(),
    inputs: vec![param("poolId", ParamType::FixedBytes(32))],
    outputs: vec![
        param("tokens", ParamType::Array(Box::new(ParamType::Address))),
        param("balances", ParamType::Array(Box::new(ParamType::Uint(256)))),
        param("lastChangeBlock", ParamType::Uint(256)),
    ],
    constant: None,
    state_mutability: StateMutability::View,
});

/// Topic0 of every vault event the pools subscribe to
pub fn vault_topics() -> Vec<H256> {
    vec![SWAP_EVENT.signature(), POOL_BALANCE_CHANGED_EVENT.signature()]
}

/// Call data for `getPoolTokens(poolId)`
pub fn encode_get_pool_tokens(pool_id: &[u8; 32]) -> Result<Vec<u8>, DecodeError> {
    GET_POOL_TOKENS
        .encode_input(&[Token::FixedBytes(pool_id.to_vec())])
        .map_err(|e| DecodeError::Abi(e.to_string()))
}

/// Decoded `getPoolTokens` return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTokens {
    pub tokens: Vec<Address>,
    pub balances: Vec<u128>,
    pub last_change_block: u64,
}

pub fn decode_get_pool_tokens(data: &[u8]) -> Result<PoolTokens, DecodeError> {
    let kinds: Vec<ParamType> = GET_POOL_TOKENS.outputs.iter().map(|p| p.kind.clone()).collect();
    let mut tokens = abi_decode(&kinds, data)?.into_iter();

    let addresses = match tokens.next() {
        Some(Token::Array(items)) => items
            .iter()
            .map(|t| token_to_address("tokens", t))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(DecodeError::MissingField("tokens".to_string())),
    };
    let balances = match tokens.next() {
        Some(Token::Array(items)) => items
            .iter()
            .map(|t| token_to_u128("balances", t))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(DecodeError::MissingField("balances".to_string())),
    };
    let last_change_block = match tokens.next() {
        Some(Token::Uint(block)) => to_u64(block)?,
        _ => return Err(DecodeError::MissingField("lastChangeBlock".to_string())),
    };

    if addresses.len() != balances.len() {
        return Err(DecodeError::InvalidPayload(format!(
            "{} tokens but {} balances",
            addresses.len(),
            balances.len()
        )));
    }

    Ok(PoolTokens {
        tokens: addresses,
        balances,
        last_change_block,
    })
}

fn to_u64(value: U256) -> Result<u64, DecodeError> {
    if value > U256::from(u64::MAX) {
        return Err(DecodeError::ValueOverflow {
            value: value.to_string(),
            target: "u64",
        });
    }
    Ok(value.as_u64())
}

/// Decode a raw vault log into a named [`EventLog`]
///
/// Only mined logs are accepted; pending logs carry no position and cannot
/// be ordered against the snapshot.
pub fn decode_vault_log(log: &Log) -> Result<EventLog, DecodeError> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| DecodeError::MissingField("topic0".to_string()))?;

    let event: &Event = if *topic0 == SWAP_EVENT.signature() {
        &SWAP_EVENT
    } else if *topic0 == POOL_BALANCE_CHANGED_EVENT.signature() {
        &POOL_BALANCE_CHANGED_EVENT
    } else {
        return Err(DecodeError::Abi(format!("unknown vault event 0x{:x}", topic0)));
    };

    let parsed = event
        .parse_log(RawLog {
            topics: log.topics.clone(),
            data: log.data.0.clone(),
        })
        .map_err(|e| DecodeError::Abi(e.to_string()))?;

    let block_number = log
        .block_number
        .ok_or_else(|| DecodeError::MissingField("blockNumber".to_string()))?
        .as_u64();
    let log_index = to_u64(
        log.log_index
            .ok_or_else(|| DecodeError::MissingField("logIndex".to_string()))?,
    )?;

    Ok(EventLog::new(
        log.address,
        event.name.clone(),
        parsed.params,
        block_number,
        log_index,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use web3::types::{Bytes, U64};

    pub(crate) fn topic_address(address: Address) -> H256 {
        let mut topic = [0u8; 32];
        topic[12..].copy_from_slice(address.as_bytes());
        H256::from(topic)
    }

    pub(crate) fn raw_log(
        vault: Address,
        topics: Vec<H256>,
        data: Vec<u8>,
        block: u64,
        index: u64,
    ) -> Log {
        Log {
            address: vault,
            topics,
            data: Bytes(data),
            block_hash: None,
            block_number: Some(U64::from(block)),
            transaction_hash: None,
            transaction_index: None,
            log_index: Some(U256::from(index)),
            transaction_log_index: None,
            log_type: None,
            removed: None,
        }
    }

    #[test]
    fn test_event_signatures_match_vault() {
        assert_eq!(
            format!("0x{:x}", SWAP_EVENT.signature()),
            "0x2170c741c41531aec20e7c107c24eecfdd15e69c9bb0a8dd37b1840b9e0b207b"
        );
        assert_eq!(
            format!("0x{:x}", POOL_BALANCE_CHANGED_EVENT.signature()),
            "0xe5ce249087ce04f05a957192435400fd97868dba0e6a4b4c049abf8af80dae78"
        );
        assert_eq!(hex::encode(GET_POOL_TOKENS.short_signature()), "f94d4668");
        assert_eq!(vault_topics().len(), 2);
    }

    #[test]
    fn test_decode_swap_log() {
        let vault = Address::repeat_byte(0xba);
        let pool_id = H256::repeat_byte(0x11);
        let data = ethabi::encode(&[Token::Uint(U256::from(500u64)), Token::Uint(U256::from(480u64))]);
        let log = raw_log(
            vault,
            vec![
                SWAP_EVENT.signature(),
                pool_id,
                topic_address(Address::repeat_byte(1)),
                topic_address(Address::repeat_byte(2)),
            ],
            data,
            42,
            7,
        );

        let decoded = decode_vault_log(&log).unwrap();
        assert_eq!(decoded.event_name, "Swap");
        assert_eq!(decoded.address, vault);
        assert_eq!((decoded.block_number, decoded.log_index), (42, 7));
        assert_eq!(decoded.fixed_bytes_param("poolId").unwrap(), pool_id.as_bytes());
        assert_eq!(decoded.address_param("tokenIn").unwrap(), Address::repeat_byte(1));
        assert_eq!(decoded.uint_param("amountOut").unwrap(), 480);
    }

    #[test]
    fn test_unknown_or_pending_log_is_rejected() {
        let vault = Address::repeat_byte(0xba);
        let unknown = raw_log(vault, vec![H256::repeat_byte(9)], vec![], 1, 0);
        assert!(matches!(decode_vault_log(&unknown), Err(DecodeError::Abi(_))));

        let data = ethabi::encode(&[Token::Uint(U256::one()), Token::Uint(U256::one())]);
        let mut pending = raw_log(
            vault,
            vec![
                SWAP_EVENT.signature(),
                H256::zero(),
                topic_address(Address::repeat_byte(1)),
                topic_address(Address::repeat_byte(2)),
            ],
            data,
            1,
            0,
        );
        pending.block_number = None;
        assert_eq!(
            decode_vault_log(&pending),
            Err(DecodeError::MissingField("blockNumber".to_string()))
        );
    }

    #[test]
    fn test_get_pool_tokens_call_and_output() {
        let call = encode_get_pool_tokens(&[0x11; 32]).unwrap();
        assert_eq!(&call[..4], &GET_POOL_TOKENS.short_signature());
        assert_eq!(call.len(), 36);

        let output = ethabi::encode(&[
            Token::Array(vec![
                Token::Address(Address::repeat_byte(1)),
                Token::Address(Address::repeat_byte(2)),
            ]),
            Token::Array(vec![Token::Uint(U256::from(10u64)), Token::Uint(U256::from(20u64))]),
            Token::Uint(U256::from(99u64)),
        ]);
        let decoded = decode_get_pool_tokens(&output).unwrap();
        assert_eq!(decoded.balances, vec![10, 20]);
        assert_eq!(decoded.last_change_block, 99);
    }
}
