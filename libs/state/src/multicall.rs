//! Multicall2 transport over web3 `eth_call`

use crate::aggregator::{MulticallTransport, RawCall, RawCallResult, TransportError};
use crate::events::Address;
use async_trait::async_trait;
use ethabi::{Function, Param, ParamType, StateMutability, Token};
use std::time::Duration;
use tracing::debug;
use web3::{
    transports::Http,
    types::{BlockId, BlockNumber, Bytes, CallRequest, U64},
    Web3,
};

fn call_tuple() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Bytes,
    ])))
}

fn param(name: &str, kind: ParamType) -> Param {
    Param {
        name: name.to_string(),
        kind,
        internal_type: None,
    }
}

/// `aggregate((address,bytes)[]) returns (uint256 blockNumber, bytes[] returnData)`
#[allow(deprecated)]
pub fn aggregate_function() -> Function {
    Function {
        name: "aggregate".to_string(),
        inputs: vec![param("calls", call_tuple())],
        outputs: vec![
            param("blockNumber", ParamType::Uint(256)),
            param("returnData", ParamType::Array(Box::new(ParamType::Bytes))),
        ],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    }
}

/// `tryAggregate(bool,(address,bytes)[]) returns ((bool success, bytes returnData)[])`
#[allow(deprecated)]
pub fn try_aggregate_function() -> Function {
    Function {
        name: "tryAggregate".to_string(),
        inputs: vec![
            param("requireSuccess", ParamType::Bool),
            param("calls", call_tuple()),
        ],
        outputs: vec![param(
            "returnData",
            ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
        )],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    }
}

fn encode_calls(calls: &[RawCall]) -> Token {
    Token::Array(
        calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bytes(call.call_data.clone()),
                ])
            })
            .collect(),
    )
}

fn malformed(what: &str) -> TransportError {
    TransportError::Malformed(what.to_string())
}

/// Decode the output of `aggregate`
pub fn decode_aggregate_output(data: &[u8]) -> Result<(u64, Vec<Vec<u8>>), TransportError> {
    let mut tokens = aggregate_function()
        .decode_output(data)
        .map_err(|e| TransportError::Malformed(e.to_string()))?
        .into_iter();

    let block_number = match tokens.next() {
        Some(Token::Uint(block)) if block <= web3::types::U256::from(u64::MAX) => block.as_u64(),
        _ => return Err(malformed("aggregate: blockNumber")),
    };
    let return_data = match tokens.next() {
        Some(Token::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Token::Bytes(bytes) => Ok(bytes),
                _ => Err(malformed("aggregate: returnData item")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(malformed("aggregate: returnData")),
    };

    Ok((block_number, return_data))
}

/// Decode the output of `tryAggregate`
pub fn decode_try_aggregate_output(data: &[u8]) -> Result<Vec<RawCallResult>, TransportError> {
    let tokens = try_aggregate_function()
        .decode_output(data)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

    let Some(Token::Array(items)) = tokens.into_iter().next() else {
        return Err(malformed("tryAggregate: returnData"));
    };

    items
        .into_iter()
        .map(|item| match item {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Bool(success), Token::Bytes(return_data)] => Ok(RawCallResult {
                    success: *success,
                    return_data: return_data.clone(),
                }),
                _ => Err(malformed("tryAggregate: result fields")),
            },
            _ => Err(malformed("tryAggregate: result")),
        })
        .collect()
}

/// Production [`MulticallTransport`] against a deployed Multicall2 contract
pub struct Web3Multicall {
    web3: Web3<Http>,
    multicall_address: Address,
    timeout: Duration,
}

impl Web3Multicall {
    /// Web3 client with connection pooling and keep-alive
    pub fn new(rpc_url: &str, multicall_address: Address, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| TransportError::Rpc(format!("Failed to create HTTP client: {}", e)))?;

        let url = rpc_url
            .parse()
            .map_err(|e| TransportError::Rpc(format!("Invalid RPC URL: {}", e)))?;

        Ok(Self {
            web3: Web3::new(Http::with_client(client, url)),
            multicall_address,
            timeout,
        })
    }

    async fn eth_call(&self, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>, TransportError> {
        let request = CallRequest {
            to: Some(self.multicall_address),
            data: Some(Bytes(data)),
            ..Default::default()
        };
        let block = block.map(|n| BlockId::Number(BlockNumber::Number(U64::from(n))));

        let result = tokio::time::timeout(self.timeout, self.web3.eth().call(request, block))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        Ok(result.0)
    }
}

#[async_trait]
impl MulticallTransport for Web3Multicall {
    async fn aggregate(
        &self,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<(u64, Vec<Vec<u8>>), TransportError> {
        let data = aggregate_function()
            .encode_input(&[encode_calls(calls)])
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        debug!("Multicall2 aggregate: {} calls at {:?}", calls.len(), block);
        let output = self.eth_call(data, block).await?;
        decode_aggregate_output(&output)
    }

    async fn try_aggregate(
        &self,
        require_success: bool,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<Vec<RawCallResult>, TransportError> {
        let data = try_aggregate_function()
            .encode_input(&[Token::Bool(require_success), encode_calls(calls)])
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        debug!("Multicall2 tryAggregate: {} calls at {:?}", calls.len(), block);
        let output = self.eth_call(data, block).await?;
        decode_try_aggregate_output(&output)
    }
}
