//! Aggregate service health.
//!
//! Pulls together per-chain pool health, live session counts, storage
//! write latency, and the deployment cache hit rate into one snapshot, and
//! logs transitions between overall states.

use crate::deployment::{CacheStats, DeploymentFinder};
use crate::error::Result;
use crate::manager::SessionManager;
use crate::rpc::{PoolHealth, RpcClientPool};
use crate::storage::{AnalysisFilter, AnalysisPatch, AnalysisRecord, AnalysisRepository};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const STORAGE_LATENCY_ALPHA: f64 = 0.2;
const STORAGE_DEGRADED_MS: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub chains: Vec<PoolHealth>,
    pub sessions: HashMap<String, usize>,
    pub storage_write_ms: Option<f64>,
    pub deployment_cache: CacheStats,
    pub deployment_cache_hit_rate: f64,
}

/// EWMA of repository write latency, fed by the instrumented repository.
#[derive(Default)]
pub struct StorageLatencyTracker {
    ewma_ms: Mutex<Option<f64>>,
}

impl StorageLatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, elapsed: std::time::Duration) {
        let sample_ms = elapsed.as_secs_f64() * 1_000.0;
        let mut ewma = self.ewma_ms.lock();
        *ewma = Some(match *ewma {
            Some(prev) => STORAGE_LATENCY_ALPHA * sample_ms + (1.0 - STORAGE_LATENCY_ALPHA) * prev,
            None => sample_ms,
        });
    }

    pub fn current_ms(&self) -> Option<f64> {
        *self.ewma_ms.lock()
    }
}

/// Repository wrapper that times every write.
pub struct InstrumentedRepository {
    inner: Arc<dyn AnalysisRepository>,
    latency: Arc<StorageLatencyTracker>,
}

impl InstrumentedRepository {
    pub fn wrap(
        inner: Arc<dyn AnalysisRepository>,
        latency: Arc<StorageLatencyTracker>,
    ) -> Arc<dyn AnalysisRepository> {
        Arc::new(Self { inner, latency })
    }
}

#[async_trait]
impl AnalysisRepository for InstrumentedRepository {
    async fn create(&self, record: AnalysisRecord) -> Result<String> {
        let started = Instant::now();
        let result = self.inner.create(record).await;
        self.latency.observe(started.elapsed());
        result
    }

    async fn update(&self, id: &str, patch: AnalysisPatch) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.update(id, patch).await;
        self.latency.observe(started.elapsed());
        result
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        filter: AnalysisFilter,
    ) -> Result<Vec<AnalysisRecord>> {
        self.inner.find_by_user(user_id, filter).await
    }

    async fn list_non_terminal(&self) -> Result<Vec<AnalysisRecord>> {
        self.inner.list_non_terminal().await
    }
}

pub struct HealthMonitor {
    pool: Arc<RpcClientPool>,
    finder: Arc<DeploymentFinder>,
    latency: Arc<StorageLatencyTracker>,
    last_status: Mutex<Option<HealthStatus>>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<RpcClientPool>,
        finder: Arc<DeploymentFinder>,
        latency: Arc<StorageLatencyTracker>,
    ) -> Self {
        Self {
            pool,
            finder,
            latency,
            last_status: Mutex::new(None),
        }
    }

    pub fn snapshot(&self, manager: &SessionManager) -> HealthSnapshot {
        let chains = self.pool.health();
        let sessions: HashMap<String, usize> = manager
            .sessions_by_state()
            .into_iter()
            .map(|(state, count)| (state.as_str().to_string(), count))
            .collect();
        let active = manager.active_session_count();
        let storage_write_ms = self.latency.current_ms();
        let cache = self.finder.cache_stats();

        let status = overall_status(&chains, active, storage_write_ms);
        self.note_transition(status);

        HealthSnapshot {
            status,
            chains,
            sessions,
            storage_write_ms,
            deployment_cache: cache,
            deployment_cache_hit_rate: cache.hit_rate(),
        }
    }

    fn note_transition(&self, status: HealthStatus) {
        let mut last = self.last_status.lock();
        match *last {
            Some(previous) if previous == status => {}
            Some(previous) => {
                if status == HealthStatus::Healthy {
                    info!("health transition: {:?} -> {:?}", previous, status);
                } else {
                    warn!("health transition: {:?} -> {:?}", previous, status);
                }
                *last = Some(status);
            }
            None => *last = Some(status),
        }
    }
}

fn overall_status(
    chains: &[PoolHealth],
    active_sessions: usize,
    storage_write_ms: Option<f64>,
) -> HealthStatus {
    let any_dead_chain = chains.iter().any(|c| c.healthy_endpoints == 0);
    if any_dead_chain && active_sessions > 0 {
        return HealthStatus::Unhealthy;
    }

    let any_open = chains.iter().any(|c| c.open_endpoints > 0);
    let storage_slow = storage_write_ms.map(|ms| ms > STORAGE_DEGRADED_MS).unwrap_or(false);
    if any_dead_chain || any_open || storage_slow {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
