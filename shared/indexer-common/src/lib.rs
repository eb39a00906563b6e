//! Shared message contracts for the streaming indexer.
//!
//! These types cross crate boundaries: the service manipulates them, the
//! control surface serializes them, and browser clients consume them as
//! JSON. Field names follow the wire convention (camelCase keys, kebab-case
//! event kinds).

use chain_common::ChainId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod tier;

pub use events::{ErrorPayload, ProgressEvent};
pub use tier::{SubscriptionTier, TierInfo};

/// The block range a session covers, derived from tier and deployment.
///
/// Invariants: `deployment_block <= start_block <= end_block` and
/// `total_blocks == end_block - start_block + 1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockWindow {
    pub start_block: u64,
    pub end_block: u64,
    pub deployment_block: u64,
    pub total_blocks: u64,
}

impl BlockWindow {
    pub fn new(start_block: u64, end_block: u64, deployment_block: u64) -> Self {
        debug_assert!(deployment_block <= start_block && start_block <= end_block);
        Self {
            start_block,
            end_block,
            deployment_block,
            total_blocks: end_block - start_block + 1,
        }
    }
}

/// Lifecycle states of an indexing session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Planning,
    Running,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Planning => "planning",
            SessionState::Running => "running",
            SessionState::Validating => "validating",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic ingestion counters accumulated over a session.
///
/// Unique counts are approximate: they come from per-chunk sets unioned at
/// reassembly and may lag while chunks are in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub tx_count: u64,
    pub log_count: u64,
    pub unique_accounts: u64,
    pub unique_blocks: u64,
    pub bytes_in: u64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub retries: u64,
}

impl SessionMetrics {
    /// Merge another set of counters into this one.
    pub fn absorb(&mut self, other: &SessionMetrics) {
        self.tx_count += other.tx_count;
        self.log_count += other.log_count;
        self.unique_accounts += other.unique_accounts;
        self.unique_blocks += other.unique_blocks;
        self.bytes_in += other.bytes_in;
        self.rpc_calls += other.rpc_calls;
        self.rpc_failures += other.rpc_failures;
        self.retries += other.retries;
    }
}

/// Read-only snapshot of a session, served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub user_id: String,
    pub contract_address: String,
    pub chain: ChainId,
    pub tier: String,
    pub state: SessionState,
    pub progress: u8,
    pub metrics: SessionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<BlockWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
