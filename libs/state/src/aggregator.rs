//! Batched remote reads
//!
//! Turns N independent contract reads into the fewest multicall round trips
//! while keeping per-call success, failure and decoding separate.
//!
//! - `aggregate`: all-or-nothing, every call observes one block height
//! - `try_aggregate`: per-call success flags, partial failure tolerated
//!
//! Requests are chunked by `max_batch_size` to respect upstream call-size
//! limits and results always come back in request order so callers can zip
//! them positionally.

use crate::events::{Address, DecodeError};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Undecoded call as it goes over the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    pub target: Address,
    pub call_data: Vec<u8>,
}

/// Undecoded per-call result of `tryAggregate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCallResult {
    pub success: bool,
    pub return_data: Vec<u8>,
}

pub type DecodeFn<T> = Box<dyn Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync>;

/// A read request carrying its own decoder
pub struct BatchCall<T> {
    pub target: Address,
    pub call_data: Vec<u8>,
    decode: DecodeFn<T>,
}

impl<T> BatchCall<T> {
    pub fn new<F>(target: Address, call_data: Vec<u8>, decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync + 'static,
    {
        Self {
            target,
            call_data,
            decode: Box::new(decode),
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<T, DecodeError> {
        (self.decode)(data)
    }

    fn raw(&self) -> RawCall {
        RawCall {
            target: self.target,
            call_data: self.call_data.clone(),
        }
    }
}

impl<T> fmt::Debug for BatchCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCall")
            .field("target", &self.target)
            .field("call_data", &hex::encode(&self.call_data))
            .finish()
    }
}

/// Transport-level failures of a whole batch
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("RPC call failed: {0}")]
    Rpc(String),

    #[error("Malformed multicall response: {0}")]
    Malformed(String),

    #[error("RPC call timed out after {0}ms")]
    Timeout(u64),
}

/// Remote aggregator endpoint (Multicall2 or an in-process fake)
#[async_trait]
pub trait MulticallTransport: Send + Sync {
    /// Atomic batch: fails as a whole if any call reverts
    async fn aggregate(
        &self,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<(u64, Vec<Vec<u8>>), TransportError>;

    /// Per-call success flags; reverts as a whole only if `require_success`
    async fn try_aggregate(
        &self,
        require_success: bool,
        calls: &[RawCall],
        block: Option<u64>,
    ) -> Result<Vec<RawCallResult>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Batch transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Call {index} to {target:?} failed")]
    CallFailed { index: usize, target: Address },

    #[error("Call {index} could not be decoded: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },

    #[error("Multicall returned {actual} results for {expected} calls")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("max_batch_size must be greater than zero")]
    InvalidBatchSize,
}

/// Result of one call inside `try_aggregate`
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Success(T),
    /// The call reverted; nothing to decode
    Failed,
    /// The call succeeded but its return data did not decode
    Undecodable(DecodeError),
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            CallOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CallOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Result of `aggregate`: one height, per-call decode results
#[derive(Debug)]
pub struct Aggregated<T> {
    pub block_number: u64,
    pub values: Vec<Result<T, DecodeError>>,
}

impl<T> Aggregated<T> {
    /// All values, or the first decode failure
    pub fn into_values(self) -> Result<Vec<T>, AggregatorError> {
        self.values
            .into_iter()
            .enumerate()
            .map(|(index, value)| value.map_err(|source| AggregatorError::Decode { index, source }))
            .collect()
    }
}

/// Groups independent reads into size-bounded multicall batches
pub struct BatchAggregator {
    transport: Arc<dyn MulticallTransport>,
    max_batch_size: usize,
}

impl fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl BatchAggregator {
    pub fn new(
        transport: Arc<dyn MulticallTransport>,
        max_batch_size: usize,
    ) -> Result<Self, AggregatorError> {
        if max_batch_size == 0 {
            return Err(AggregatorError::InvalidBatchSize);
        }
        Ok(Self {
            transport,
            max_batch_size,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// All-or-nothing batch read pinned to a single block height.
    ///
    /// Chunks run sequentially: when `block` is `None` the height reported by
    /// the first chunk is pinned for every later chunk. An empty request list
    /// makes no round trip and reports `block.unwrap_or(0)`.
    pub async fn aggregate<T>(
        &self,
        calls: &[BatchCall<T>],
        block: Option<u64>,
    ) -> Result<Aggregated<T>, AggregatorError> {
        let mut pinned = block;
        let mut values = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(self.max_batch_size) {
            let raw: Vec<RawCall> = chunk.iter().map(BatchCall::raw).collect();
            let (height, return_data) = self.transport.aggregate(&raw, pinned).await?;

            if return_data.len() != chunk.len() {
                return Err(AggregatorError::LengthMismatch {
                    expected: chunk.len(),
                    actual: return_data.len(),
                });
            }
            pinned.get_or_insert(height);

            values.extend(
                chunk
                    .iter()
                    .zip(return_data.iter())
                    .map(|(call, data)| call.decode(data)),
            );
        }

        let block_number = pinned.unwrap_or_default();
        debug!(
            "aggregate: {} calls in {} batches at block {}",
            calls.len(),
            calls.len().div_ceil(self.max_batch_size),
            block_number
        );

        Ok(Aggregated {
            block_number,
            values,
        })
    }

    /// Partial-failure tolerant batch read.
    ///
    /// Chunks run concurrently and are concatenated in request order. With
    /// `require_all_success` any reverted call fails the whole batch;
    /// otherwise reverted calls surface as [`CallOutcome::Failed`].
    pub async fn try_aggregate<T>(
        &self,
        require_all_success: bool,
        calls: &[BatchCall<T>],
        block: Option<u64>,
    ) -> Result<Vec<CallOutcome<T>>, AggregatorError> {
        let chunks: Vec<Vec<RawCall>> = calls
            .chunks(self.max_batch_size)
            .map(|chunk| chunk.iter().map(BatchCall::raw).collect())
            .collect();

        let responses = try_join_all(chunks.iter().map(|raw| {
            self.transport
                .try_aggregate(require_all_success, raw, block)
        }))
        .await?;

        let mut results = Vec::with_capacity(calls.len());
        for (raw, response) in chunks.iter().zip(responses) {
            if response.len() != raw.len() {
                return Err(AggregatorError::LengthMismatch {
                    expected: raw.len(),
                    actual: response.len(),
                });
            }
            results.extend(response);
        }

        let mut outcomes = Vec::with_capacity(calls.len());
        for (index, (call, result)) in calls.iter().zip(results).enumerate() {
            if !result.success {
                if require_all_success {
                    return Err(AggregatorError::CallFailed {
                        index,
                        target: call.target,
                    });
                }
                debug!("try_aggregate: call {} to {:?} failed", index, call.target);
                outcomes.push(CallOutcome::Failed);
                continue;
            }

            match call.decode(&result.return_data) {
                Ok(value) => outcomes.push(CallOutcome::Success(value)),
                Err(e) => {
                    warn!(
                        "try_aggregate: call {} to {:?} returned undecodable data: {}",
                        index, call.target, e
                    );
                    outcomes.push(CallOutcome::Undecodable(e));
                }
            }
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode_uint;
    use crate::test_utils::{encode_uint, uint_call, ScriptedMulticall};
    use std::time::Duration;

    fn target(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    /// Every call returns its target's first byte times ten; target 3 reverts
    fn multicall() -> ScriptedMulticall {
        ScriptedMulticall::new(|call, _block| {
            let n = call.target.as_bytes()[0];
            (n != 3).then(|| encode_uint(n as u128 * 10))
        })
    }

    fn calls(targets: &[u8]) -> Vec<BatchCall<u128>> {
        targets.iter().map(|n| uint_call(target(*n))).collect()
    }

    #[tokio::test]
    async fn test_try_aggregate_isolates_failed_call() {
        let transport = Arc::new(multicall());
        let aggregator = BatchAggregator::new(transport, 2).unwrap();

        let outcomes = aggregator
            .try_aggregate(false, &calls(&[1, 2, 3, 4, 5]), None)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 4);
        assert_eq!(outcomes[2], CallOutcome::Failed);
        assert_eq!(outcomes[0].value(), Some(&10));
        assert_eq!(outcomes[3].value(), Some(&40));
        assert_eq!(outcomes[4].value(), Some(&50));
    }

    #[tokio::test]
    async fn test_try_aggregate_require_all_success_fails_whole_call() {
        let transport = Arc::new(multicall());
        let aggregator = BatchAggregator::new(transport, 10).unwrap();

        let result = aggregator
            .try_aggregate(true, &calls(&[1, 2, 3, 4, 5]), None)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_abort_other_calls() {
        let transport = Arc::new(multicall());
        let aggregator = BatchAggregator::new(transport, 10).unwrap();

        let mut batch = calls(&[1, 2]);
        batch.insert(
            1,
            BatchCall::new(target(7), vec![], |data: &[u8]| {
                decode_uint(data)?;
                Err(DecodeError::InvalidPayload("rejected".to_string()))
            }),
        );

        let outcomes = aggregator.try_aggregate(false, &batch, None).await.unwrap();

        assert_eq!(outcomes[0].value(), Some(&10));
        assert!(matches!(outcomes[1], CallOutcome::Undecodable(_)));
        assert_eq!(outcomes[2].value(), Some(&20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_aggregate_preserves_order_when_chunks_finish_out_of_order() {
        // Earlier chunks are slower, so completion order is reversed
        let transport = Arc::new(multicall().with_latency(|calls| {
            let n = calls[0].target.as_bytes()[0] as u64;
            Duration::from_millis(100 - n * 10)
        }));
        let aggregator = BatchAggregator::new(transport.clone(), 1).unwrap();

        let outcomes = aggregator
            .try_aggregate(false, &calls(&[1, 2, 4]), None)
            .await
            .unwrap();

        let values: Vec<u128> = outcomes.into_iter().filter_map(|o| o.into_value()).collect();
        assert_eq!(values, vec![10, 20, 40]);
        assert_eq!(transport.try_aggregate_calls(), 3);
    }

    #[tokio::test]
    async fn test_aggregate_pins_height_across_chunks() {
        let transport = Arc::new(multicall());
        transport.set_head_block(120);
        let aggregator = BatchAggregator::new(transport.clone(), 2).unwrap();

        let aggregated = aggregator.aggregate(&calls(&[1, 2, 4, 5, 6]), None).await.unwrap();

        assert_eq!(aggregated.block_number, 120);
        assert_eq!(
            aggregated.into_values().unwrap(),
            vec![10, 20, 40, 50, 60]
        );
        assert_eq!(transport.requested_blocks(), vec![None, Some(120), Some(120)]);
        assert_eq!(transport.batch_sizes(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_aggregate_fails_when_any_call_fails() {
        let transport = Arc::new(multicall());
        let aggregator = BatchAggregator::new(transport, 10).unwrap();

        let result = aggregator.aggregate(&calls(&[1, 3]), None).await;
        assert!(matches!(result, Err(AggregatorError::Transport(_))));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let transport = Arc::new(multicall());
        assert!(matches!(
            BatchAggregator::new(transport, 0),
            Err(AggregatorError::InvalidBatchSize)
        ));
    }
}
