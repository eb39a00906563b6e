//! Streaming contract indexer.
//!
//! Given a contract address, a chain, and a user's subscription tier, the
//! indexer streams the contract's on-chain history from its deployment
//! block to the chain head: the window is divided into chunks, chunks are
//! fetched in parallel through a failover RPC pool, boundaries are
//! validated, and progress is pushed to subscribers while durable results
//! land in the repository.

pub mod api;
pub mod chunk;
pub mod config;
pub mod deployment;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod publisher;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod testing;
pub mod tier;
pub mod validator;

pub use config::IndexerConfig;
pub use error::{IndexerError, Result};

use crate::deployment::DeploymentFinder;
use crate::fetcher::{ContractFetcher, RpcContractFetcher};
use crate::health::{HealthMonitor, InstrumentedRepository, StorageLatencyTracker};
use crate::manager::SessionManager;
use crate::publisher::ProgressPublisher;
use crate::rpc::RpcClientPool;
use crate::session::SessionContext;
use crate::storage::{AnalysisRepository, SubscriptionSource};
use std::sync::Arc;

/// Composition root: one value owning the wired-up service. Tests build
/// fresh instances; nothing lives in globals.
pub struct IndexerService {
    pub config: Arc<IndexerConfig>,
    pub pool: Arc<RpcClientPool>,
    pub publisher: Arc<ProgressPublisher>,
    pub manager: Arc<SessionManager>,
    pub health: Arc<HealthMonitor>,
}

impl IndexerService {
    pub fn new(
        config: IndexerConfig,
        repo: Arc<dyn AnalysisRepository>,
        subscriptions: Arc<dyn SubscriptionSource>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(RpcClientPool::new(&config));
        let fetcher: Arc<dyn ContractFetcher> = Arc::new(RpcContractFetcher::new(pool.clone()));
        let finder = Arc::new(DeploymentFinder::new(fetcher.clone()));
        let publisher = Arc::new(ProgressPublisher::new());

        let latency = Arc::new(StorageLatencyTracker::new());
        let repo = InstrumentedRepository::wrap(repo, latency.clone());

        let ctx = Arc::new(SessionContext {
            config: config.clone(),
            fetcher,
            finder: finder.clone(),
            publisher: publisher.clone(),
            repo,
        });
        let manager = Arc::new(SessionManager::new(ctx, subscriptions));
        let health = Arc::new(HealthMonitor::new(pool.clone(), finder, latency));

        Arc::new(Self {
            config,
            pool,
            publisher,
            manager,
            health,
        })
    }

    /// Startup recovery: fail sessions a previous process left behind.
    /// Must complete before the control surface accepts requests.
    pub async fn recover_stale(&self) -> Result<usize> {
        self.manager.recover_stale().await
    }
}
