//! Per-endpoint token-bucket rate limiting.
//!
//! Buckets are sized to the endpoint's published QPS; a full bucket allows
//! a burst of one second's worth of calls. Waiting for a token honours the
//! call deadline and cancellation.

use crate::error::{IndexerError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `qps` tokens per second, capacity `qps`.
pub struct TokenBucket {
    qps: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(qps: u32) -> Self {
        let qps = f64::from(qps.max(1));
        Self {
            qps,
            state: Mutex::new(BucketState {
                tokens: qps,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for a refill if necessary. Fails with
    /// `TransientRpc` once `deadline` passes and `Cancelled` when the token
    /// fires.
    pub async fn acquire(&self, deadline: Instant, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                // Time until one whole token is available.
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
            };

            let now = Instant::now();
            if now + wait > deadline {
                return Err(IndexerError::TransientRpc(
                    "rate limit wait exceeds call deadline".to_string(),
                ));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Take one token without waiting. Used by background probes, which
    /// prefer to skip a cycle over queueing behind foreground traffic.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        state.last_refill = Instant::now();
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.qps).min(self.qps);
    }
}
