//! Per-chain fetch adapters over the RPC pool.
//!
//! The `ContractFetcher` trait is the seam between chunk execution and the
//! wire: EVM chains answer `eth_getLogs` in one call, Starknet paginates
//! `starknet_getEvents` and the adapter drains every page before returning.
//! Both normalize into the chain-agnostic `LogRecord` shape.

use crate::error::{IndexerError, Result};
use crate::rpc::endpoint_pool::is_overflow_message;
use crate::rpc::{CallOptions, RpcClientPool};
use async_trait::async_trait;
use chain_common::{format_hex_u64, parse_hex_u64, ChainId, LogRecord};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const STARKNET_PAGE_SIZE: u32 = 1_000;

#[async_trait]
pub trait ContractFetcher: Send + Sync {
    /// Highest known block number.
    async fn get_head(&self, chain: ChainId, opts: &CallOptions) -> Result<u64>;

    /// All logs emitted by `address` in `[from_block, to_block]`, both ends
    /// inclusive. Overflow surfaces as `ChunkOverflow`.
    async fn get_logs(
        &self,
        chain: ChainId,
        address: &str,
        from_block: u64,
        to_block: u64,
        opts: &CallOptions,
    ) -> Result<Vec<LogRecord>>;

    /// Contract code at a block, `"0x"` when the address holds none.
    async fn get_code_at(
        &self,
        chain: ChainId,
        address: &str,
        block: u64,
        opts: &CallOptions,
    ) -> Result<String>;
}

/// Fetcher backed by the multi-chain RPC pool.
pub struct RpcContractFetcher {
    pool: Arc<RpcClientPool>,
}

impl RpcContractFetcher {
    pub fn new(pool: Arc<RpcClientPool>) -> Self {
        Self { pool }
    }

    async fn evm_logs(
        &self,
        chain: ChainId,
        address: &str,
        from_block: u64,
        to_block: u64,
        opts: &CallOptions,
    ) -> Result<Vec<LogRecord>> {
        let params = json!([{
            "address": address,
            "fromBlock": format_hex_u64(from_block),
            "toBlock": format_hex_u64(to_block),
        }]);

        let result = self
            .pool
            .call(chain, "eth_getLogs", params, opts)
            .await
            .map_err(|e| map_overflow(e, from_block, to_block))?;

        let raw: Vec<EvmLog> = serde_json::from_value(result)
            .map_err(|e| IndexerError::PermanentRpc(format!("malformed log entry: {}", e)))?;

        raw.into_iter().map(EvmLog::into_record).collect()
    }

    async fn starknet_logs(
        &self,
        chain: ChainId,
        address: &str,
        from_block: u64,
        to_block: u64,
        opts: &CallOptions,
    ) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        let mut page = 0u64;

        loop {
            let mut filter = json!({
                "from_block": { "block_number": from_block },
                "to_block": { "block_number": to_block },
                "address": address,
                "chunk_size": STARKNET_PAGE_SIZE,
            });
            if let Some(token) = &continuation {
                filter["continuation_token"] = Value::String(token.clone());
            }

            let result = self
                .pool
                .call(chain, "starknet_getEvents", json!([filter]), opts)
                .await
                .map_err(|e| map_overflow(e, from_block, to_block))?;

            let page_result: StarknetEventsPage = serde_json::from_value(result)
                .map_err(|e| IndexerError::PermanentRpc(format!("malformed events page: {}", e)))?;

            let offset = records.len() as u64;
            records.extend(
                page_result
                    .events
                    .into_iter()
                    .enumerate()
                    .map(|(i, ev)| ev.into_record(offset + i as u64)),
            );

            match page_result.continuation_token {
                Some(token) if !token.is_empty() => {
                    page += 1;
                    debug!(
                        "draining starknet_getEvents page {} for {} ({} events so far)",
                        page,
                        address,
                        records.len()
                    );
                    continuation = Some(token);
                }
                _ => break,
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl ContractFetcher for RpcContractFetcher {
    async fn get_head(&self, chain: ChainId, opts: &CallOptions) -> Result<u64> {
        if chain.is_evm() {
            let result = self
                .pool
                .call(chain, "eth_blockNumber", json!([]), opts)
                .await?;
            let hex: String = serde_json::from_value(result)
                .map_err(|e| IndexerError::PermanentRpc(format!("malformed head: {}", e)))?;
            parse_hex_u64(&hex)
                .map_err(|e| IndexerError::PermanentRpc(format!("malformed head: {}", e)))
        } else {
            let result = self
                .pool
                .call(chain, "starknet_blockNumber", json!([]), opts)
                .await?;
            serde_json::from_value(result)
                .map_err(|e| IndexerError::PermanentRpc(format!("malformed head: {}", e)))
        }
    }

    async fn get_logs(
        &self,
        chain: ChainId,
        address: &str,
        from_block: u64,
        to_block: u64,
        opts: &CallOptions,
    ) -> Result<Vec<LogRecord>> {
        if chain.is_evm() {
            self.evm_logs(chain, address, from_block, to_block, opts)
                .await
        } else {
            self.starknet_logs(chain, address, from_block, to_block, opts)
                .await
        }
    }

    async fn get_code_at(
        &self,
        chain: ChainId,
        address: &str,
        block: u64,
        opts: &CallOptions,
    ) -> Result<String> {
        if chain.is_evm() {
            let params = json!([address, format_hex_u64(block)]);
            let result = self.pool.call(chain, "eth_getCode", params, opts).await?;
            serde_json::from_value(result)
                .map_err(|e| IndexerError::PermanentRpc(format!("malformed code: {}", e)))
        } else {
            let params = json!([{ "block_number": block }, address]);
            match self
                .pool
                .call(chain, "starknet_getClassHashAt", params, opts)
                .await
            {
                Ok(result) => serde_json::from_value(result)
                    .map_err(|e| IndexerError::PermanentRpc(format!("malformed class hash: {}", e))),
                // "Contract not found" is the Starknet spelling of empty code.
                Err(IndexerError::PermanentRpc(msg))
                    if msg.to_lowercase().contains("contract not found") =>
                {
                    Ok("0x".to_string())
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Translate overflow-style permanent errors into `ChunkOverflow` so the
/// chunk manager can split instead of failing.
fn map_overflow(err: IndexerError, from: u64, to: u64) -> IndexerError {
    match &err {
        IndexerError::PermanentRpc(msg) if is_overflow_message(&msg.to_lowercase()) => {
            IndexerError::ChunkOverflow { from, to }
        }
        _ => err,
    }
}

#[derive(Debug, Deserialize)]
struct EvmLog {
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "logIndex")]
    log_index: String,
    address: String,
    topics: Vec<String>,
    data: String,
}

impl EvmLog {
    fn into_record(self) -> Result<LogRecord> {
        Ok(LogRecord {
            block_number: parse_hex_u64(&self.block_number)
                .map_err(|e| IndexerError::PermanentRpc(format!("bad log blockNumber: {}", e)))?,
            tx_hash: self.transaction_hash,
            log_index: parse_hex_u64(&self.log_index)
                .map_err(|e| IndexerError::PermanentRpc(format!("bad logIndex: {}", e)))?,
            address: self.address.to_lowercase(),
            topics: self.topics,
            data: self.data,
            tx_from: None,
            tx_to: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StarknetEventsPage {
    events: Vec<StarknetEvent>,
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StarknetEvent {
    from_address: String,
    keys: Vec<String>,
    data: Vec<String>,
    block_number: u64,
    transaction_hash: String,
}

impl StarknetEvent {
    fn into_record(self, log_index: u64) -> LogRecord {
        LogRecord {
            block_number: self.block_number,
            tx_hash: self.transaction_hash,
            log_index,
            address: self.from_address.to_lowercase(),
            topics: self.keys,
            data: concat_felts(&self.data),
            tx_from: None,
            tx_to: None,
        }
    }
}

/// Concatenate felt words into one hex string, each left-padded to 32 bytes.
fn concat_felts(felts: &[String]) -> String {
    let mut out = String::from("0x");
    for felt in felts {
        let raw = felt.strip_prefix("0x").unwrap_or(felt);
        out.push_str(&"0".repeat(64usize.saturating_sub(raw.len())));
        out.push_str(raw);
    }
    out
}
