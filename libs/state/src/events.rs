//! Decoded event logs
//!
//! The store never touches raw log bytes. A log-decoding collaborator turns each
//! remote log into an [`EventLog`] and the store routes it by event name.
//! Typed accessors convert ABI tokens into the narrow integer types pool state
//! uses, rejecting values that would be silently truncated.

use ethabi::{LogParam, ParamType, Token};
use web3::types::{H160, U256};

/// 20-byte contract address
pub type Address = H160;

/// Error types for log and call-result decoding
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("ABI decoding failed: {0}")]
    Abi(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Field {field} is not a {expected}")]
    UnexpectedType {
        field: String,
        expected: &'static str,
    },

    #[error("Value overflow: {value} does not fit in {target}")]
    ValueOverflow { value: String, target: &'static str },

    #[error("Token {0:?} is not part of the pool")]
    UnknownToken(Address),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// One decoded log entry, ordered by `(block_number, log_index)`
#[derive(Debug, Clone, PartialEq)]
pub struct EventLog {
    pub address: Address,
    pub event_name: String,
    pub params: Vec<LogParam>,
    pub block_number: u64,
    pub log_index: u64,
}

impl EventLog {
    pub fn new(
        address: Address,
        event_name: impl Into<String>,
        params: Vec<LogParam>,
        block_number: u64,
        log_index: u64,
    ) -> Self {
        Self {
            address,
            event_name: event_name.into(),
            params,
            block_number,
            log_index,
        }
    }

    pub fn param(&self, name: &str) -> Result<&Token, DecodeError> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))
    }

    pub fn address_param(&self, name: &str) -> Result<Address, DecodeError> {
        token_to_address(name, self.param(name)?)
    }

    pub fn uint_param(&self, name: &str) -> Result<u128, DecodeError> {
        token_to_u128(name, self.param(name)?)
    }

    pub fn fixed_bytes_param(&self, name: &str) -> Result<Vec<u8>, DecodeError> {
        match self.param(name)? {
            Token::FixedBytes(bytes) => Ok(bytes.clone()),
            _ => Err(unexpected(name, "bytesN")),
        }
    }

    pub fn address_array_param(&self, name: &str) -> Result<Vec<Address>, DecodeError> {
        array(name, self.param(name)?)?
            .iter()
            .map(|t| token_to_address(name, t))
            .collect()
    }

    pub fn uint_array_param(&self, name: &str) -> Result<Vec<u128>, DecodeError> {
        array(name, self.param(name)?)?
            .iter()
            .map(|t| token_to_u128(name, t))
            .collect()
    }

    pub fn int_array_param(&self, name: &str) -> Result<Vec<i128>, DecodeError> {
        array(name, self.param(name)?)?
            .iter()
            .map(|t| token_to_i128(name, t))
            .collect()
    }
}

fn unexpected(field: &str, expected: &'static str) -> DecodeError {
    DecodeError::UnexpectedType {
        field: field.to_string(),
        expected,
    }
}

fn array<'a>(field: &str, token: &'a Token) -> Result<&'a [Token], DecodeError> {
    match token {
        Token::Array(items) | Token::FixedArray(items) => Ok(items),
        _ => Err(unexpected(field, "array")),
    }
}

pub fn token_to_address(field: &str, token: &Token) -> Result<Address, DecodeError> {
    match token {
        Token::Address(address) => Ok(*address),
        _ => Err(unexpected(field, "address")),
    }
}

pub fn token_to_u128(field: &str, token: &Token) -> Result<u128, DecodeError> {
    match token {
        Token::Uint(value) => u256_to_u128(*value),
        _ => Err(unexpected(field, "uint")),
    }
}

/// Two's complement `int256` into `i128`
pub fn token_to_i128(field: &str, token: &Token) -> Result<i128, DecodeError> {
    let raw = match token {
        Token::Int(value) => *value,
        _ => return Err(unexpected(field, "int")),
    };

    if !raw.bit(255) {
        if raw > U256::from(i128::MAX as u128) {
            return Err(DecodeError::ValueOverflow {
                value: raw.to_string(),
                target: "i128",
            });
        }
        return Ok(raw.as_u128() as i128);
    }

    let magnitude = (!raw).overflowing_add(U256::one()).0;
    let min_magnitude = U256::from(1u128 << 127);
    if magnitude > min_magnitude {
        return Err(DecodeError::ValueOverflow {
            value: format!("-{}", magnitude),
            target: "i128",
        });
    }
    if magnitude == min_magnitude {
        return Ok(i128::MIN);
    }
    Ok(-(magnitude.as_u128() as i128))
}

pub fn u256_to_u128(value: U256) -> Result<u128, DecodeError> {
    if value > U256::from(u128::MAX) {
        return Err(DecodeError::ValueOverflow {
            value: value.to_string(),
            target: "u128",
        });
    }
    Ok(value.as_u128())
}

/// `ethabi::decode` with the error mapped into [`DecodeError`]
pub fn abi_decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, DecodeError> {
    ethabi::decode(types, data).map_err(|e| DecodeError::Abi(e.to_string()))
}

/// Decode a single `uint256` return value
pub fn decode_uint(data: &[u8]) -> Result<u128, DecodeError> {
    let tokens = abi_decode(&[ParamType::Uint(256)], data)?;
    tokens
        .first()
        .ok_or_else(|| DecodeError::MissingField("uint256".to_string()))
        .and_then(|t| token_to_u128("uint256", t))
}

/// Decode a single `address` return value
pub fn decode_address(data: &[u8]) -> Result<Address, DecodeError> {
    let tokens = abi_decode(&[ParamType::Address], data)?;
    tokens
        .first()
        .ok_or_else(|| DecodeError::MissingField("address".to_string()))
        .and_then(|t| token_to_address("address", t))
}
