//! Chain-agnostic primitives shared across the indexer services.
//!
//! Everything here is plain data: chain identities with their static
//! parameters, hex quantity helpers, and the normalized log shape that
//! per-chain fetchers produce.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chains. The set is closed; adding a chain means adding a
/// variant and its parameters here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Ethereum,
    Lisk,
    Starknet,
}

impl ChainId {
    pub const ALL: [ChainId; 3] = [ChainId::Ethereum, ChainId::Lisk, ChainId::Starknet];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Lisk => "lisk",
            ChainId::Starknet => "starknet",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ethereum" | "eth" => Some(ChainId::Ethereum),
            "lisk" => Some(ChainId::Lisk),
            "starknet" | "strk" => Some(ChainId::Starknet),
            _ => None,
        }
    }

    /// Average seconds between blocks.
    pub fn block_time_secs(&self) -> u64 {
        match self {
            ChainId::Ethereum => 12,
            ChainId::Lisk => 12,
            ChainId::Starknet => 6,
        }
    }

    /// Blocks produced per day at the average block time.
    pub fn blocks_per_day(&self) -> u64 {
        match self {
            ChainId::Ethereum => 7_200,
            ChainId::Lisk => 7_200,
            ChainId::Starknet => 14_400,
        }
    }

    /// Default chunk size for log backfills, in blocks.
    pub fn default_chunk_size(&self) -> u64 {
        200_000
    }

    /// Whether the chain speaks standard EVM JSON-RPC.
    pub fn is_evm(&self) -> bool {
        !matches!(self, ChainId::Starknet)
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid hex quantity '{0}'")]
    InvalidHex(String),
    #[error("unknown chain '{0}'")]
    UnknownChain(String),
}

/// Parse an `0x`-prefixed hex quantity into a u64.
pub fn parse_hex_u64(hex_str: &str) -> Result<u64, ParseError> {
    let trimmed = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    u64::from_str_radix(trimmed, 16).map_err(|_| ParseError::InvalidHex(hex_str.to_string()))
}

/// Format a u64 as an `0x`-prefixed hex quantity.
pub fn format_hex_u64(value: u64) -> String {
    format!("0x{:x}", value)
}

/// ERC-20 Transfer event signature, keccak256("Transfer(address,address,uint256)").
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// A log event in the chain-agnostic shape produced by every fetcher.
///
/// `tx_from`/`tx_to` are populated only when the enclosing transaction is
/// cheap to resolve; participant counting never reads them and works from
/// topics alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub tx_from: Option<String>,
    pub tx_to: Option<String>,
}

impl LogRecord {
    /// Accounts that participated in this log, extracted from indexed
    /// Transfer topics. Topics carry addresses left-padded to 32 bytes.
    /// Counting is topic-only; the transaction sender/recipient are never
    /// consulted.
    pub fn participant_accounts(&self) -> Vec<String> {
        let mut accounts = Vec::new();
        if self.topics.first().map(|t| t.as_str()) == Some(TRANSFER_TOPIC) {
            for topic in self.topics.iter().skip(1).take(2) {
                if let Some(addr) = address_from_topic(topic) {
                    accounts.push(addr);
                }
            }
        }
        accounts
    }

    /// Approximate serialized size, used for ingress accounting.
    pub fn byte_len(&self) -> u64 {
        let topics: usize = self.topics.iter().map(|t| t.len()).sum();
        (self.tx_hash.len() + self.address.len() + self.data.len() + topics + 16) as u64
    }
}

/// Extract the 20-byte address from a 32-byte indexed topic.
pub fn address_from_topic(topic: &str) -> Option<String> {
    let raw = topic.strip_prefix("0x")?;
    if raw.len() != 64 {
        return None;
    }
    let addr = &raw[24..];
    // Reject non-hex topics rather than inventing an address.
    if hex::decode(addr).is_err() {
        return None;
    }
    Some(format!("0x{}", addr.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_roundtrip() {
        for chain in ChainId::ALL {
            assert_eq!(ChainId::from_str(chain.as_str()), Some(chain));
        }
        assert_eq!(ChainId::from_str("dogecoin"), None);
    }

    #[test]
    fn test_blocks_per_day() {
        assert_eq!(ChainId::Ethereum.blocks_per_day(), 7_200);
        assert_eq!(ChainId::Lisk.blocks_per_day(), 7_200);
        assert_eq!(ChainId::Starknet.blocks_per_day(), 14_400);
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert!(parse_hex_u64("0xzz").is_err());
        assert_eq!(format_hex_u64(29_000_000), "0x1ba8140");
    }

    #[test]
    fn test_address_from_topic() {
        let topic = "0x000000000000000000000000a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
        assert_eq!(
            address_from_topic(topic).unwrap(),
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert_eq!(address_from_topic("0x1234"), None);
    }

    #[test]
    fn test_participant_accounts_from_transfer() {
        let log = LogRecord {
            block_number: 1,
            tx_hash: "0xabc".into(),
            log_index: 0,
            address: "0xtoken".into(),
            topics: vec![
                TRANSFER_TOPIC.to_string(),
                "0x000000000000000000000000a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
                "0x000000000000000000000000dac17f958d2ee523a2206206994597c13d831ec7".into(),
            ],
            data: "0x1".into(),
            tx_from: None,
            tx_to: None,
        };
        let accounts = log.participant_accounts();
        assert_eq!(accounts.len(), 2);
        assert!(accounts.contains(&"0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()));
    }

    #[test]
    fn test_participant_accounts_ignores_tx_parties() {
        // Non-Transfer log: nothing to count, even when the enclosing
        // transaction's parties happen to be known.
        let log = LogRecord {
            block_number: 1,
            tx_hash: "0xabc".into(),
            log_index: 0,
            address: "0xtoken".into(),
            topics: vec!["0xdeadbeef".into()],
            data: "0x".into(),
            tx_from: Some("0xAA".into()),
            tx_to: Some("0xBB".into()),
        };
        assert!(log.participant_accounts().is_empty());
    }
}
