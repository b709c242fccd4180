//! Test utilities for the state sync engine
//!
//! In-process fakes for the multicall endpoint, the HTTP collaborator and a
//! minimal pool family, so stores, registries and fetchers can be exercised
//! without a network.

use crate::aggregator::{BatchCall, MulticallTransport, RawCall, RawCallResult, TransportError};
use crate::events::{decode_uint, Address, DecodeError, EventLog};
use crate::http::{HttpError, HttpRequest, HttpRequester};
use crate::traits::{EventHandlers, PoolStateSource};
use async_trait::async_trait;
use ethabi::{LogParam, Token};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use web3::types::U256;

pub fn encode_uint(value: u128) -> Vec<u8> {
    ethabi::encode(&[Token::Uint(U256::from(value))])
}

/// A call whose result is one `uint256`
pub fn uint_call(target: Address) -> BatchCall<u128> {
    BatchCall::new(target, vec![], decode_uint)
}

type Responder = Box<dyn Fn(&RawCall, u64) -> Option<Vec<u8>> + Send + Sync>;
type Latency = Box<dyn Fn(&[RawCall]) -> Duration + Send + Sync>;

/// Multicall endpoint answering from a closure.
///
/// The responder gets each call and the height it is evaluated at and returns
/// the return data, or `None` to make that call revert.
pub struct ScriptedMulticall {
    responder: Responder,
    latency: Option<Latency>,
    head_block: AtomicU64,
    aggregate_calls: AtomicUsize,
    try_aggregate_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requested_blocks: Mutex<Vec<Option<u64>>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedMulticall {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RawCall, u64) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency: None,
            head_block: AtomicU64::new(1),
            aggregate_calls: AtomicUsize::new(0),
            try_aggregate_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requested_blocks: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Delay every batch by the returned duration
    pub fn with_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&[RawCall]) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Box::new(latency));
        self
    }

    pub fn set_head_block(&self, block: u64) {
        self.head_block.store(block, Ordering::SeqCst);
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn try_aggregate_calls(&self) -> usize {
        self.try_aggregate_calls.load(Ordering::SeqCst)
    }

    /// Highest number of batches observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requested_blocks(&self) -> Vec<Option<u64>> {
        self.requested_blocks.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    async fn evaluate(&self, calls: &[RawCall], block: Option<u64>) -> (u64, Vec<Option<Vec<u8>>>) {
        self.requested_blocks.lock().push(block);
        self.batch_sizes.lock().push(calls.len());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(calls)).await;
        }

        let height = block.unwrap_or_else(|| self.head_block.load(Ordering::SeqCst));
        let results = calls.iter().map(|call| (self.responder)(call, height)).collect();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (height, results)
    }
}

#[async_trait]
impl MulticallTransport for ScriptedMulticall {
    async fn aggregate(
        &self,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<(u64, Vec<Vec<u8>>), TransportError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let (height, results) = self.evaluate(calls, block).await;
        let data = results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TransportError::Rpc("execution reverted".to_string()))?;
        Ok((height, data))
    }

    async fn try_aggregate(
        &self,
        require_success: bool,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<Vec<RawCallResult>, TransportError> {
        self.try_aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let (_, results) = self.evaluate(calls, block).await;
        if require_success && results.iter().any(Option::is_none) {
            return Err(TransportError::Rpc(
                "Multicall2 aggregate: call failed".to_string(),
            ));
        }
        Ok(results
            .into_iter()
            .map(|data| RawCallResult {
                success: data.is_some(),
                return_data: data.unwrap_or_default(),
            })
            .collect())
    }
}

/// Token balance history served to [`LedgerSource`] rebuilds
#[derive(Clone, Default)]
pub struct LedgerChain {
    history: Arc<Mutex<BTreeMap<u64, HashMap<Address, u128>>>>,
}

impl LedgerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full balance set as of `block`
    pub fn set_balances(&self, block: u64, balances: &[(Address, u128)]) {
        self.history
            .lock()
            .insert(block, balances.iter().copied().collect());
    }

    /// Balance at the latest recorded block not after `block`
    pub fn balance_at(&self, token: Address, block: u64) -> Option<u128> {
        let history = self.history.lock();
        let (_, balances) = history.range(..=block).next_back()?;
        balances.get(&token).copied()
    }

    /// Multicall endpoint answering ledger balance reads from this history
    pub fn multicall(&self) -> ScriptedMulticall {
        let chain = self.clone();
        ScriptedMulticall::new(move |call, block| {
            if call.call_data.len() != 20 {
                return None;
            }
            chain
                .balance_at(Address::from_slice(&call.call_data), block)
                .map(encode_uint)
        })
    }
}

/// HTTP collaborator replaying queued responses
#[derive(Default)]
pub struct ScriptedHttp {
    responses: Mutex<VecDeque<Result<serde_json::Value, HttpError>>>,
    latency: Mutex<Option<Duration>>,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<serde_json::Value, HttpError>) {
        self.responses.lock().push_back(response);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpRequester for ScriptedHttp {
    async fn request(&self, request: &HttpRequest) -> Result<serde_json::Value, HttpError> {
        self.requests.lock().push(request.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::Request("no scripted response".to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balances: Vec<u128>,
}

/// Minimal pool family: one balance per token, moved by `Deposit` and
/// `Withdraw(token, amount)` logs emitted by the pool address.
///
/// Rebuild reads one `uint256` per token from the pool; `call_data` is the
/// token address.
pub struct LedgerSource {
    address: Address,
    tokens: Vec<Address>,
    fee_on_transfer: bool,
}

impl LedgerSource {
    pub fn new(address: Address, tokens: Vec<Address>) -> Self {
        Self {
            address,
            tokens,
            fee_on_transfer: false,
        }
    }

    pub fn with_fee_on_transfer(mut self) -> Self {
        self.fee_on_transfer = true;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

fn token_index(tokens: &[Address], log: &EventLog) -> Result<usize, DecodeError> {
    let token = log.address_param("token")?;
    tokens
        .iter()
        .position(|t| *t == token)
        .ok_or(DecodeError::UnknownToken(token))
}

impl PoolStateSource for LedgerSource {
    type State = LedgerState;
    type CallOutput = u128;

    fn tokens(&self) -> &[Address] {
        &self.tokens
    }

    fn supports_fee_on_transfer(&self) -> bool {
        self.fee_on_transfer
    }

    fn is_relevant(&self, log: &EventLog) -> bool {
        log.address == self.address
    }

    fn on_chain_calls(&self) -> Vec<BatchCall<u128>> {
        self.tokens
            .iter()
            .map(|token| BatchCall::new(self.address, token.as_bytes().to_vec(), decode_uint))
            .collect()
    }

    fn decode_on_chain_calls(&self, outputs: Vec<u128>) -> Result<LedgerState, DecodeError> {
        if outputs.len() != self.tokens.len() {
            return Err(DecodeError::InvalidPayload(format!(
                "expected {} balances, got {}",
                self.tokens.len(),
                outputs.len()
            )));
        }
        Ok(LedgerState { balances: outputs })
    }

    fn register_handlers(&self, handlers: &mut EventHandlers<LedgerState>) {
        let tokens = self.tokens.clone();
        handlers.register("Deposit", move |state, log| {
            let index = token_index(&tokens, log)?;
            let amount = log.uint_param("amount")?;
            state.balances[index] = state.balances[index]
                .checked_add(amount)
                .ok_or_else(|| DecodeError::InvalidPayload("balance overflow".to_string()))?;
            Ok(())
        });

        let tokens = self.tokens.clone();
        handlers.register("Withdraw", move |state, log| {
            let index = token_index(&tokens, log)?;
            let amount = log.uint_param("amount")?;
            state.balances[index] = state.balances[index]
                .checked_sub(amount)
                .ok_or_else(|| DecodeError::InvalidPayload("balance underflow".to_string()))?;
            Ok(())
        });
    }
}

fn ledger_log(
    event_name: &str,
    pool: Address,
    token: Address,
    amount: u128,
    block_number: u64,
    log_index: u64,
) -> EventLog {
    EventLog::new(
        pool,
        event_name,
        vec![
            LogParam {
                name: "token".to_string(),
                value: Token::Address(token),
            },
            LogParam {
                name: "amount".to_string(),
                value: Token::Uint(U256::from(amount)),
            },
        ],
        block_number,
        log_index,
    )
}

pub fn deposit_log(pool: Address, token: Address, amount: u128, block_number: u64, log_index: u64) -> EventLog {
    ledger_log("Deposit", pool, token, amount, block_number, log_index)
}

pub fn withdraw_log(pool: Address, token: Address, amount: u128, block_number: u64, log_index: u64) -> EventLog {
    ledger_log("Withdraw", pool, token, amount, block_number, log_index)
}
