//! Vault log feed
//!
//! Polls the vault's `Swap` and `PoolBalanceChanged` logs block range by
//! block range and routes them into the registry. Runs as a regular
//! [`Fetcher`] job, so ranges are never fetched concurrently and a failed
//! range is retried on the next tick from the same starting block.

use super::abi::{decode_vault_log, vault_topics};
use super::VerifiedRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use state_sync::{Address, FetchError, FetchHandler, FetchSource};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};
use web3::{
    transports::Http,
    types::{BlockNumber, FilterBuilder, Log, H256, U64},
    Web3,
};

/// Upper bound of blocks requested per tick
pub const MAX_BLOCK_RANGE: u64 = 2_000;

#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn block_number(&self) -> Result<u64, FetchError>;

    /// Logs emitted by `address` matching any of `topics`, `from..=to`
    async fn logs(
        &self,
        address: Address,
        topics: Vec<H256>,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, FetchError>;
}

/// `eth_blockNumber` / `eth_getLogs` over web3
pub struct Web3LogProvider {
    web3: Web3<Http>,
    timeout: Duration,
}

impl Web3LogProvider {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let transport = Http::new(rpc_url)
            .map_err(|e| FetchError::InvalidConfig(format!("Invalid RPC URL: {}", e)))?;
        Ok(Self {
            web3: Web3::new(transport),
            timeout,
        })
    }

    async fn bounded<F, T>(&self, call: F) -> Result<T, FetchError>
    where
        F: std::future::Future<Output = web3::Result<T>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(|e| FetchError::Request(e.to_string()))
    }
}

#[async_trait]
impl LogProvider for Web3LogProvider {
    async fn block_number(&self) -> Result<u64, FetchError> {
        let head = self.bounded(self.web3.eth().block_number()).await?;
        Ok(head.as_u64())
    }

    async fn logs(
        &self,
        address: Address,
        topics: Vec<H256>,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, FetchError> {
        let filter = FilterBuilder::default()
            .address(vec![address])
            .topics(Some(topics), None, None, None)
            .from_block(BlockNumber::Number(U64::from(from)))
            .to_block(BlockNumber::Number(U64::from(to)))
            .build();
        self.bounded(self.web3.eth().logs(filter)).await
    }
}

/// Logs of one block range; `to_block` is the last block covered
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub to_block: u64,
    pub logs: Vec<Log>,
}

pub struct VaultLogFeed {
    provider: Arc<dyn LogProvider>,
    vault: Address,
    registry: Weak<VerifiedRegistry>,
    next_block: Mutex<Option<u64>>,
    max_range: u64,
}

impl VaultLogFeed {
    /// Starts at the head observed on the first tick; earlier history is
    /// covered by the stores' rebuilds.
    pub fn new(provider: Arc<dyn LogProvider>, vault: Address, registry: &Arc<VerifiedRegistry>) -> Self {
        Self {
            provider,
            vault,
            registry: Arc::downgrade(registry),
            next_block: Mutex::new(None),
            max_range: MAX_BLOCK_RANGE,
        }
    }

    pub fn with_start_block(self, block: u64) -> Self {
        *self.next_block.lock() = Some(block);
        self
    }

    pub fn with_max_range(mut self, blocks: u64) -> Self {
        self.max_range = blocks.max(1);
        self
    }

    /// First block the next tick will request
    pub fn next_block(&self) -> Option<u64> {
        *self.next_block.lock()
    }
}

#[async_trait]
impl FetchSource<LogBatch> for VaultLogFeed {
    async fn fetch(&self) -> Result<LogBatch, FetchError> {
        let head = self.provider.block_number().await?;
        let from = self.next_block().unwrap_or(head);
        if from > head {
            return Ok(LogBatch {
                to_block: from - 1,
                logs: Vec::new(),
            });
        }

        let to = head.min(from + self.max_range - 1);
        let logs = self
            .provider
            .logs(self.vault, vault_topics(), from, to)
            .await?;
        debug!("Vault logs {}..={}: {}", from, to, logs.len());
        Ok(LogBatch { to_block: to, logs })
    }
}

#[async_trait]
impl FetchHandler<LogBatch> for VaultLogFeed {
    async fn handle(&self, mut batch: LogBatch) -> Result<(), FetchError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| FetchError::Handler("registry released".to_string()))?;

        batch
            .logs
            .sort_by_key(|log| (log.block_number, log.log_index));

        let mut applied = 0;
        for log in &batch.logs {
            if log.removed == Some(true) {
                continue;
            }
            match decode_vault_log(log) {
                Ok(event) => applied += registry.apply_log(&event),
                Err(e) => warn!("Skipping undecodable vault log: {}", e),
            }
        }

        *self.next_block.lock() = Some(batch.to_block + 1);
        if applied > 0 {
            debug!("Applied {} vault log updates up to block {}", applied, batch.to_block);
        }
        Ok(())
    }
}
