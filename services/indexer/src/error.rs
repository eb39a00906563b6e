//! Error types for the streaming indexer.

use chain_common::ChainId;
use indexer_common::ErrorPayload;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexerError {
    #[error("transient RPC failure: {0}")]
    TransientRpc(String),

    #[error("permanent RPC failure: {0}")]
    PermanentRpc(String),

    #[error("no healthy endpoint for chain {0}")]
    NoHealthyEndpoint(ChainId),

    #[error("log query overflow for blocks {from}-{to}")]
    ChunkOverflow { from: u64, to: u64 },

    #[error("log query still overflowing at the split floor for blocks {from}-{to}")]
    ChunkOverflowUnrecoverable { from: u64, to: u64 },

    #[error("coverage gap after chunk {after:?}: blocks {missing_from}-{missing_to} uncovered")]
    ValidationGap {
        after: Option<usize>,
        missing_from: u64,
        missing_to: u64,
    },

    #[error("chunks {left} and {right} overlap")]
    ValidationOverlap { left: usize, right: usize },

    #[error("chunk {index} violates ordering or log bounds")]
    ValidationOutOfOrder { index: usize },

    #[error("no contract code at {address} on {chain}")]
    NotAContract { chain: ChainId, address: String },

    #[error("a session for this contract is already running: {session_id}")]
    AlreadyRunning { session_id: String },

    #[error("contract limit reached for tier {tier} (max {max})")]
    ContractLimit { tier: String, max: u32 },

    #[error("hard deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("session went stale and was recovered")]
    Stale,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IndexerError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexerError::TransientRpc(_)
                | IndexerError::NoHealthyEndpoint(_)
                | IndexerError::ChunkOverflow { .. }
                | IndexerError::Timeout
                | IndexerError::Stale
                | IndexerError::StorageUnavailable(_)
        )
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            IndexerError::TransientRpc(_) => "transient-rpc",
            IndexerError::PermanentRpc(_) => "permanent-rpc",
            IndexerError::NoHealthyEndpoint(_) => "no-healthy-endpoint",
            IndexerError::ChunkOverflow { .. } => "chunk-overflow",
            IndexerError::ChunkOverflowUnrecoverable { .. } => "chunk-overflow-unrecoverable",
            IndexerError::ValidationGap { .. } => "validation-gap",
            IndexerError::ValidationOverlap { .. } => "validation-overlap",
            IndexerError::ValidationOutOfOrder { .. } => "validation-out-of-order",
            IndexerError::NotAContract { .. } => "not-a-contract",
            IndexerError::AlreadyRunning { .. } => "already-running",
            IndexerError::ContractLimit { .. } => "contract-limit",
            IndexerError::Timeout => "timeout",
            IndexerError::Cancelled => "cancelled",
            IndexerError::Stale => "stale",
            IndexerError::StorageUnavailable(_) => "storage-unavailable",
            IndexerError::UnknownSession(_) => "unknown-session",
            IndexerError::InvalidRequest(_) => "invalid-request",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IndexerError::TransientRpc("connection reset".into()).is_retryable());
        assert!(IndexerError::NoHealthyEndpoint(ChainId::Lisk).is_retryable());
        assert!(!IndexerError::PermanentRpc("bad params".into()).is_retryable());
        assert!(!IndexerError::Cancelled.is_retryable());
        assert!(!IndexerError::NotAContract {
            chain: ChainId::Ethereum,
            address: "0xae".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_wire_payload() {
        let err = IndexerError::AlreadyRunning {
            session_id: "s1".into(),
        };
        let payload = err.to_payload();
        assert_eq!(payload.code, "already-running");
        assert!(!payload.retryable);
        assert!(payload.message.contains("s1"));
    }
}
