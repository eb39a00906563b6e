//! Multi-chain RPC client pool.
//!
//! One `EndpointPool` per chain, created lazily on the chain's first use;
//! background health probes start with the pool. The facade exposes a
//! single `call` entry point that the fetchers build on.

pub mod circuit_breaker;
pub mod endpoint_pool;
pub mod rate_limit;

pub use endpoint_pool::{
    EndpointPool, EndpointPoolConfig, EndpointState, PoolHealth, RpcRequest,
};

use crate::config::IndexerConfig;
use crate::error::{IndexerError, Result};
use chain_common::ChainId;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-call options: deadline and cancellation, plus a priority hint.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl CallOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel,
        }
    }
}

/// Pool of endpoint pools, keyed by chain.
pub struct RpcClientPool {
    endpoint_urls: HashMap<ChainId, Vec<String>>,
    pool_config: EndpointPoolConfig,
    probe_interval: Duration,
    client: reqwest::Client,
    pools: RwLock<HashMap<ChainId, Arc<EndpointPool>>>,
    shutdown: CancellationToken,
}

impl RpcClientPool {
    pub fn new(config: &IndexerConfig) -> Self {
        let pool_config = EndpointPoolConfig {
            request_timeout: config.request_timeout,
            max_retries: config.rpc_max_retries,
            base_delay: config.rpc_base_delay,
            max_delay: config.rpc_max_delay,
            endpoint_qps: config.endpoint_qps,
            max_concurrency: 64,
            circuit_breaker: crate::rpc::circuit_breaker::CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                cooldown: config.circuit_cooldown,
                cooldown_cap: config.circuit_cooldown_cap,
            },
        };

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent("contract-indexer/0.1")
            .build()
            .unwrap_or_default();

        Self {
            endpoint_urls: config.endpoints.clone(),
            pool_config,
            probe_interval: config.health_probe_interval,
            client,
            pools: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Make a JSON-RPC call on a chain with failover across its endpoints.
    pub async fn call(
        &self,
        chain: ChainId,
        method: &str,
        params: Value,
        opts: &CallOptions,
    ) -> Result<Value> {
        let pool = self.pool_for(chain)?;
        let request = RpcRequest::new(method, params);
        pool.call(&request, opts).await
    }

    /// Health snapshots for every chain that has been used so far.
    pub fn health(&self) -> Vec<PoolHealth> {
        self.pools.read().values().map(|p| p.health()).collect()
    }

    /// Stop background probes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Fetch or lazily create the chain's pool. Probes start with the
    /// pool, so a chain nobody indexes costs nothing.
    fn pool_for(&self, chain: ChainId) -> Result<Arc<EndpointPool>> {
        if let Some(pool) = self.pools.read().get(&chain) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&chain) {
            return Ok(pool.clone());
        }

        let urls = self
            .endpoint_urls
            .get(&chain)
            .cloned()
            .ok_or(IndexerError::NoHealthyEndpoint(chain))?;

        let pool = Arc::new(EndpointPool::new(
            chain,
            urls,
            self.client.clone(),
            self.pool_config.clone(),
        )?);
        info!("initialized RPC pool for {}", chain);

        tokio::spawn(
            pool.clone()
                .run_probe_loop(self.probe_interval, self.shutdown.child_token()),
        );

        pools.insert(chain, pool.clone());
        Ok(pool)
    }
}

impl Drop for RpcClientPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
