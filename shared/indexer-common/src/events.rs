//! Progress event contract pushed to stream subscribers.
//!
//! One JSON object per frame, discriminated by `kind`. Terminal kinds are
//! the last event a subscriber sees for a session.

use crate::SessionMetrics;
use chain_common::ChainId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error object carried by failure events and the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Events published over a session's progress channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        session_id: String,
        progress: u8,
        metrics: SessionMetrics,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Metric {
        session_id: String,
        metrics: SessionMetrics,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ChunkCompleted {
        session_id: String,
        chunk_index: usize,
        from_block: u64,
        to_block: u64,
        log_count: u64,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ChunkFailed {
        session_id: String,
        chunk_index: usize,
        error: ErrorPayload,
        ts: DateTime<Utc>,
    },
    /// Soft-deadline notice; informational, the session keeps running.
    #[serde(rename_all = "camelCase")]
    Slow {
        session_id: String,
        elapsed_secs: u64,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RpcDegraded {
        session_id: String,
        chain: ChainId,
        endpoint: String,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: String,
        metrics: SessionMetrics,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SessionFailed {
        session_id: String,
        error: ErrorPayload,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SessionCancelled {
        session_id: String,
        ts: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { session_id, .. }
            | ProgressEvent::Metric { session_id, .. }
            | ProgressEvent::ChunkCompleted { session_id, .. }
            | ProgressEvent::ChunkFailed { session_id, .. }
            | ProgressEvent::Slow { session_id, .. }
            | ProgressEvent::RpcDegraded { session_id, .. }
            | ProgressEvent::SessionCompleted { session_id, .. }
            | ProgressEvent::SessionFailed { session_id, .. }
            | ProgressEvent::SessionCancelled { session_id, .. } => session_id,
        }
    }

    /// Terminal events close the stream and are never dropped by queues.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::SessionCompleted { .. }
                | ProgressEvent::SessionFailed { .. }
                | ProgressEvent::SessionCancelled { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Metric { .. } => "metric",
            ProgressEvent::ChunkCompleted { .. } => "chunk-completed",
            ProgressEvent::ChunkFailed { .. } => "chunk-failed",
            ProgressEvent::Slow { .. } => "slow",
            ProgressEvent::RpcDegraded { .. } => "rpc-degraded",
            ProgressEvent::SessionCompleted { .. } => "session-completed",
            ProgressEvent::SessionFailed { .. } => "session-failed",
            ProgressEvent::SessionCancelled { .. } => "session-cancelled",
        }
    }
}
