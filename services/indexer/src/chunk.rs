//! Chunk planning and execution.
//!
//! A window is divided into fixed-size contiguous chunks; each chunk is one
//! unit of fetch work. When a provider refuses a range as too large, the
//! range is halved recursively down to a floor. Planning is deterministic:
//! the same window always yields the same chunks, which resume depends on.

use crate::error::{IndexerError, Result};
use crate::fetcher::ContractFetcher;
use crate::metrics::Metrics;
use crate::rpc::CallOptions;
use chain_common::{ChainId, LogRecord};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use indexer_common::{BlockWindow, ErrorPayload};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Validated,
    Persisted,
    Failed,
    Abandoned,
}

/// One contiguous block range of a session's window.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub from_block: u64,
    pub to_block: u64,
    pub state: ChunkState,
    pub attempts: u32,
    pub log_count: u64,
    pub first_log: Option<LogRecord>,
    pub last_log: Option<LogRecord>,
    pub min_log_block: Option<u64>,
    pub max_log_block: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorPayload>,
}

impl Chunk {
    fn new(index: usize, from_block: u64, to_block: u64) -> Self {
        Self {
            index,
            from_block,
            to_block,
            state: ChunkState::Pending,
            attempts: 0,
            log_count: 0,
            first_log: None,
            last_log: None,
            min_log_block: None,
            max_log_block: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn blocks(&self) -> u64 {
        self.to_block - self.from_block + 1
    }
}

/// Divide a window into contiguous chunks of `chunk_size` blocks, the last
/// one possibly shorter.
pub fn plan(window: &BlockWindow, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut from = window.start_block;
    while from <= window.end_block {
        let to = from
            .saturating_add(chunk_size - 1)
            .min(window.end_block);
        chunks.push(Chunk::new(chunks.len(), from, to));
        if to == window.end_block {
            break;
        }
        from = to + 1;
    }
    chunks
}

/// Everything a completed chunk contributes to the session.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub from_block: u64,
    pub to_block: u64,
    pub log_count: u64,
    pub first_log: Option<LogRecord>,
    pub last_log: Option<LogRecord>,
    pub min_log_block: Option<u64>,
    pub max_log_block: Option<u64>,
    pub accounts: HashSet<String>,
    pub blocks: HashSet<u64>,
    pub tx_hashes: HashSet<String>,
    pub bytes_in: u64,
    pub splits: u32,
}

impl ChunkOutcome {
    fn from_logs(from_block: u64, to_block: u64, logs: Vec<LogRecord>, splits: u32) -> Self {
        let mut outcome = ChunkOutcome {
            from_block,
            to_block,
            log_count: logs.len() as u64,
            first_log: logs.first().cloned(),
            last_log: logs.last().cloned(),
            splits,
            ..Default::default()
        };
        for log in &logs {
            outcome.min_log_block = Some(match outcome.min_log_block {
                Some(min) => min.min(log.block_number),
                None => log.block_number,
            });
            outcome.max_log_block = Some(match outcome.max_log_block {
                Some(max) => max.max(log.block_number),
                None => log.block_number,
            });
            outcome.blocks.insert(log.block_number);
            outcome.tx_hashes.insert(log.tx_hash.clone());
            outcome.bytes_in += log.byte_len();
            for account in log.participant_accounts() {
                outcome.accounts.insert(account);
            }
        }
        outcome
    }
}

/// Fetch one chunk, splitting on overflow down to `floor_blocks`.
pub async fn execute(
    fetcher: &dyn ContractFetcher,
    chain: ChainId,
    address: &str,
    from_block: u64,
    to_block: u64,
    floor_blocks: u64,
    opts: &CallOptions,
) -> Result<ChunkOutcome> {
    let mut splits = 0u32;
    let logs = fetch_range(
        fetcher,
        chain,
        address,
        from_block,
        to_block,
        floor_blocks,
        opts,
        &mut splits,
    )
    .await?;
    Ok(ChunkOutcome::from_logs(from_block, to_block, logs, splits))
}

/// Recursive half-splitting fetch. Boxed because async recursion needs an
/// indirection.
#[allow(clippy::too_many_arguments)]
fn fetch_range<'a>(
    fetcher: &'a dyn ContractFetcher,
    chain: ChainId,
    address: &'a str,
    from_block: u64,
    to_block: u64,
    floor_blocks: u64,
    opts: &'a CallOptions,
    splits: &'a mut u32,
) -> BoxFuture<'a, Result<Vec<LogRecord>>> {
    async move {
        match fetcher
            .get_logs(chain, address, from_block, to_block, opts)
            .await
        {
            Ok(logs) => Ok(logs),
            Err(IndexerError::ChunkOverflow { .. }) => {
                let span = to_block - from_block + 1;
                if span <= floor_blocks {
                    return Err(IndexerError::ChunkOverflowUnrecoverable {
                        from: from_block,
                        to: to_block,
                    });
                }

                let mid = from_block + span / 2 - 1;
                debug!(
                    "overflow on [{}, {}], splitting at {} for {}",
                    from_block, to_block, mid, address
                );
                *splits += 1;
                Metrics::chunk_split();

                let mut logs = fetch_range(
                    fetcher,
                    chain,
                    address,
                    from_block,
                    mid,
                    floor_blocks,
                    opts,
                    splits,
                )
                .await?;
                let right = fetch_range(
                    fetcher,
                    chain,
                    address,
                    mid + 1,
                    to_block,
                    floor_blocks,
                    opts,
                    splits,
                )
                .await?;
                logs.extend(right);
                Ok(logs)
            }
            Err(e) => Err(e),
        }
    }
    .boxed()
}
