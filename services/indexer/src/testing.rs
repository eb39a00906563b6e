//! Test doubles shared across the crate's test modules.
//!
//! `MockFetcher` is a scriptable `ContractFetcher`: it serves a synthetic
//! chain with a configurable head, deployment block, log density, overflow
//! threshold, artificial latency, and scripted transient failures.

use crate::error::{IndexerError, Result};
use crate::fetcher::ContractFetcher;
use crate::rpc::CallOptions;
use async_trait::async_trait;
use chain_common::{ChainId, LogRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct MockFetcher {
    head: u64,
    deployment: Option<u64>,
    /// Overflow any `get_logs` span strictly greater than this.
    overflow_above: Option<u64>,
    /// Emit one log every N blocks (the first block of every N-aligned
    /// stripe, relative to the range start).
    log_density: Option<u64>,
    /// Fail the first N `get_logs` calls with a transient error.
    transient_failures: AtomicU64,
    /// Added latency per call; cancellable.
    delay: Duration,
    log_calls: AtomicU64,
    code_calls: AtomicU64,
    head_calls: AtomicU64,
}

impl MockFetcher {
    pub fn new(head: u64) -> Self {
        Self {
            head,
            deployment: None,
            overflow_above: None,
            log_density: None,
            transient_failures: AtomicU64::new(0),
            delay: Duration::ZERO,
            log_calls: AtomicU64::new(0),
            code_calls: AtomicU64::new(0),
            head_calls: AtomicU64::new(0),
        }
    }

    pub fn with_deployment(mut self, block: u64) -> Self {
        self.deployment = Some(block);
        self
    }

    pub fn with_overflow_above(mut self, span: u64) -> Self {
        self.overflow_above = Some(span);
        self
    }

    pub fn with_log_density(mut self, blocks_per_log: u64) -> Self {
        self.log_density = Some(blocks_per_log.max(1));
        self
    }

    pub fn with_transient_failures(self, count: u64) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn log_calls(&self) -> u64 {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn code_calls(&self) -> u64 {
        self.code_calls.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> u64 {
        self.head_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self, opts: &CallOptions) -> Result<()> {
        if self.delay.is_zero() {
            if opts.cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            return Ok(());
        }
        tokio::select! {
            _ = opts.cancel.cancelled() => Err(IndexerError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }

    fn synthetic_logs(&self, from_block: u64, to_block: u64) -> Vec<LogRecord> {
        let Some(density) = self.log_density else {
            return Vec::new();
        };
        let mut logs = Vec::new();
        let mut block = from_block;
        while block <= to_block {
            logs.push(LogRecord {
                block_number: block,
                tx_hash: format!("0xtx{:016x}", block),
                log_index: 0,
                address: "0xae".to_string(),
                topics: vec![format!("0xtopic{:x}", block % 7)],
                data: "0x00".to_string(),
                tx_from: None,
                tx_to: None,
            });
            block = match block.checked_add(density) {
                Some(next) => next,
                None => break,
            };
        }
        logs
    }
}

#[async_trait]
impl ContractFetcher for MockFetcher {
    async fn get_head(&self, _chain: ChainId, opts: &CallOptions) -> Result<u64> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(opts).await?;
        Ok(self.head)
    }

    async fn get_logs(
        &self,
        _chain: ChainId,
        _address: &str,
        from_block: u64,
        to_block: u64,
        opts: &CallOptions,
    ) -> Result<Vec<LogRecord>> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(opts).await?;

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(IndexerError::TransientRpc("scripted failure".to_string()));
        }

        let span = to_block - from_block + 1;
        if let Some(limit) = self.overflow_above {
            if span > limit {
                return Err(IndexerError::ChunkOverflow {
                    from: from_block,
                    to: to_block,
                });
            }
        }

        Ok(self.synthetic_logs(from_block, to_block))
    }

    async fn get_code_at(
        &self,
        _chain: ChainId,
        _address: &str,
        block: u64,
        opts: &CallOptions,
    ) -> Result<String> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(opts).await?;
        match self.deployment {
            Some(deployed_at) if block >= deployed_at => Ok("0x6080604052".to_string()),
            _ => Ok("0x".to_string()),
        }
    }
}
