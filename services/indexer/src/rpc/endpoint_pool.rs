//! Per-chain endpoint pool with prioritized failover.
//!
//! Manages the ordered endpoint list for one chain:
//! - Priority selection (highest first), skipping open circuits
//! - Per-endpoint retry with exponential backoff and jitter
//! - Circuit breaker and token-bucket rate limit per endpoint
//! - Latency EWMA fed by calls and background head probes
//!
//! Failover advances to the next endpoint only on transient errors;
//! permanent errors fail the call immediately.

use crate::error::{IndexerError, Result};
use crate::metrics::Metrics;
use crate::rpc::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::rpc::rate_limit::TokenBucket;
use crate::rpc::CallOptions;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chain_common::ChainId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// JSON-RPC request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: 1,
        }
    }
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Externally visible endpoint state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointState {
    Healthy,
    Degraded,
    OpenCircuit,
}

/// One configured endpoint and its runtime health.
pub struct Endpoint {
    pub url: String,
    pub priority: usize,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    latency_ewma_ms: Mutex<Option<f64>>,
    last_probe_at: Mutex<Option<DateTime<Utc>>>,
}

impl Endpoint {
    fn new(url: String, priority: usize, config: &EndpointPoolConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(url.clone(), config.circuit_breaker.clone()),
            limiter: TokenBucket::new(config.endpoint_qps),
            url,
            priority,
            latency_ewma_ms: Mutex::new(None),
            last_probe_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EndpointState {
        match self.breaker.state() {
            CircuitState::Closed => EndpointState::Healthy,
            CircuitState::HalfOpen => EndpointState::Degraded,
            CircuitState::Open => EndpointState::OpenCircuit,
        }
    }

    fn observe_latency(&self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1_000.0;
        let mut ewma = self.latency_ewma_ms.lock();
        *ewma = Some(match *ewma {
            Some(prev) => LATENCY_EWMA_ALPHA * sample_ms + (1.0 - LATENCY_EWMA_ALPHA) * prev,
            None => sample_ms,
        });
    }

    pub fn latency_ewma_ms(&self) -> Option<f64> {
        *self.latency_ewma_ms.lock()
    }
}

/// Endpoint pool configuration.
#[derive(Debug, Clone)]
pub struct EndpointPoolConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub endpoint_qps: u32,
    pub max_concurrency: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EndpointPoolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            endpoint_qps: 10,
            max_concurrency: 64,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Endpoint pool for one chain.
pub struct EndpointPool {
    chain: ChainId,
    endpoints: Vec<Arc<Endpoint>>,
    client: HttpClient,
    config: EndpointPoolConfig,
    /// Global cap on concurrent calls for this chain.
    concurrency: Arc<Semaphore>,
}

impl EndpointPool {
    pub fn new(
        chain: ChainId,
        urls: Vec<String>,
        client: HttpClient,
        config: EndpointPoolConfig,
    ) -> Result<Self> {
        if urls.is_empty() {
            return Err(IndexerError::InvalidRequest(format!(
                "no RPC endpoints configured for chain {}",
                chain
            )));
        }

        let endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(priority, url)| Arc::new(Endpoint::new(url, priority, &config)))
            .collect();

        Ok(Self {
            chain,
            endpoints,
            client,
            concurrency: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Call with failover down the priority list. Permanent errors and
    /// cancellation abort immediately; transient errors advance to the next
    /// endpoint. `NoHealthyEndpoint` when every circuit is open.
    pub async fn call(&self, request: &RpcRequest, opts: &CallOptions) -> Result<Value> {
        let _permit = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(IndexerError::Cancelled),
            permit = self.concurrency.clone().acquire_owned() => {
                permit.map_err(|_| IndexerError::TransientRpc("pool closed".to_string()))?
            }
        };

        let mut last_error = None;
        let mut admitted = false;

        for endpoint in &self.endpoints {
            if !endpoint.breaker.can_execute() {
                continue;
            }
            admitted = true;

            match self.call_endpoint(endpoint, request, opts).await {
                Ok(value) => return Ok(value),
                Err(err @ IndexerError::Cancelled) => return Err(err),
                Err(err @ IndexerError::PermanentRpc(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        "endpoint {} failed for {} on {}: {}",
                        endpoint.url, request.method, self.chain, err
                    );
                    last_error = Some(err);
                }
            }
        }

        if !admitted {
            return Err(IndexerError::NoHealthyEndpoint(self.chain));
        }
        Err(last_error
            .unwrap_or_else(|| IndexerError::TransientRpc("all endpoints failed".to_string())))
    }

    /// Issue the request against one endpoint with the per-endpoint retry
    /// schedule. A cancelled attempt neither counts as a retry nor touches
    /// the breaker.
    async fn call_endpoint(
        &self,
        endpoint: &Endpoint,
        request: &RpcRequest,
        opts: &CallOptions,
    ) -> Result<Value> {
        let timeout = opts.timeout.unwrap_or(self.config.request_timeout);
        let mut schedule = self.retry_schedule();
        let mut attempt = 0;
        let mut last_error;

        loop {
            attempt += 1;
            let deadline = Instant::now() + timeout;
            endpoint.limiter.acquire(deadline, &opts.cancel).await?;

            Metrics::rpc_call(self.chain);
            let started = Instant::now();
            match self.send(endpoint, request, timeout, opts).await {
                Ok(value) => {
                    endpoint.observe_latency(started.elapsed());
                    endpoint.breaker.record_success();
                    return Ok(value);
                }
                Err(IndexerError::Cancelled) => return Err(IndexerError::Cancelled),
                Err(err @ IndexerError::PermanentRpc(_)) => {
                    // Not the endpoint's fault; leave the breaker alone.
                    return Err(err);
                }
                Err(err) => {
                    Metrics::rpc_failure(self.chain);
                    endpoint.breaker.record_failure();
                    debug!(
                        "attempt {}/{} against {} failed: {}",
                        attempt, self.config.max_retries, endpoint.url, err
                    );
                    last_error = err;
                }
            }

            if attempt >= self.config.max_retries
                || endpoint.breaker.state() == CircuitState::Open
            {
                return Err(last_error);
            }

            let delay = schedule
                .next_backoff()
                .unwrap_or(self.config.max_delay);
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &RpcRequest,
        timeout: Duration,
        opts: &CallOptions,
    ) -> Result<Value> {
        let send = self
            .client
            .post(&endpoint.url)
            .timeout(timeout)
            .json(request)
            .send();

        let response = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(IndexerError::Cancelled),
            response = send => response.map_err(classify_transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status));
        }

        let body: RpcResponse = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(IndexerError::Cancelled),
            body = response.json::<RpcResponse>() => body.map_err(|e| {
                IndexerError::PermanentRpc(format!("malformed JSON-RPC response: {}", e))
            })?,
        };

        if let Some(error) = body.error {
            return Err(classify_rpc_error(error.code, &error.message));
        }

        body.result
            .ok_or_else(|| IndexerError::PermanentRpc("no result in RPC response".to_string()))
    }

    /// One probe pass over every endpoint: a cheap head-block request that
    /// refreshes circuit state and the latency EWMA. Open circuits that
    /// have not cooled down are skipped, so probing never defeats the
    /// cooldown.
    pub async fn probe_once(&self) {
        let request = RpcRequest::new(head_method(self.chain), serde_json::json!([]));
        for endpoint in &self.endpoints {
            if !endpoint.breaker.can_execute() {
                continue;
            }
            if !endpoint.limiter.try_acquire() {
                continue;
            }

            let started = Instant::now();
            let opts = CallOptions::default();
            match self
                .send(endpoint, &request, Duration::from_secs(5), &opts)
                .await
            {
                Ok(_) => {
                    endpoint.observe_latency(started.elapsed());
                    endpoint.breaker.record_success();
                }
                Err(IndexerError::PermanentRpc(msg)) => {
                    // A probe that provokes a permanent error still proves
                    // the endpoint is reachable.
                    debug!("probe to {} returned permanent error: {}", endpoint.url, msg);
                    endpoint.observe_latency(started.elapsed());
                    endpoint.breaker.record_success();
                }
                Err(err) => {
                    debug!("probe to {} failed: {}", endpoint.url, err);
                    endpoint.breaker.record_failure();
                }
            }
            *endpoint.last_probe_at.lock() = Some(Utc::now());
        }
    }

    /// Background probe loop, started lazily with the pool.
    pub async fn run_probe_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        info!(
            "starting health probes for {} ({} endpoints, every {:?})",
            self.chain,
            self.endpoints.len(),
            interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("health probes for {} stopping", self.chain);
                    return;
                }
                _ = ticker.tick() => self.probe_once().await,
            }
        }
    }

    pub fn health(&self) -> PoolHealth {
        let endpoints: Vec<EndpointHealth> = self
            .endpoints
            .iter()
            .map(|e| EndpointHealth {
                url: e.url.clone(),
                priority: e.priority,
                state: e.state(),
                consecutive_failures: e.breaker.consecutive_failures(),
                latency_ewma_ms: e.latency_ewma_ms(),
                last_probe_at: *e.last_probe_at.lock(),
            })
            .collect();

        let healthy = endpoints
            .iter()
            .filter(|e| e.state == EndpointState::Healthy)
            .count();
        let open = endpoints
            .iter()
            .filter(|e| e.state == EndpointState::OpenCircuit)
            .count();

        PoolHealth {
            chain: self.chain,
            total_endpoints: endpoints.len(),
            healthy_endpoints: healthy,
            open_endpoints: open,
            endpoints,
        }
    }

    fn retry_schedule(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.base_delay,
            max_interval: self.config.max_delay,
            multiplier: 2.0,
            randomization_factor: 0.25,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Snapshot of one chain's endpoint health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub chain: ChainId,
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub open_endpoints: usize,
    pub endpoints: Vec<EndpointHealth>,
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        self.healthy_endpoints > 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealth {
    pub url: String,
    pub priority: usize,
    pub state: EndpointState,
    pub consecutive_failures: u32,
    pub latency_ewma_ms: Option<f64>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Cheap head-block probe method per chain.
pub fn head_method(chain: ChainId) -> &'static str {
    if chain.is_evm() {
        "eth_blockNumber"
    } else {
        "starknet_blockNumber"
    }
}

fn classify_transport_error(err: reqwest::Error) -> IndexerError {
    // Network-level failures are always worth a retry somewhere else.
    IndexerError::TransientRpc(format!("transport error: {}", err))
}

fn classify_http_status(status: reqwest::StatusCode) -> IndexerError {
    if status.as_u16() == 429 || status.is_server_error() {
        IndexerError::TransientRpc(format!("HTTP status {}", status))
    } else {
        IndexerError::PermanentRpc(format!("HTTP status {}", status))
    }
}

/// Map a JSON-RPC error object onto the taxonomy. Overflow-style refusals
/// are permanent from the pool's point of view; the chunk layer recognizes
/// them by message and splits instead of retrying.
pub fn classify_rpc_error(code: i64, message: &str) -> IndexerError {
    let lower = message.to_lowercase();

    if is_overflow_message(&lower) {
        return IndexerError::PermanentRpc(message.to_string());
    }

    let transient_text = lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("rate limit")
        || lower.contains("too many requests");

    // -32603 internal error and the generic -32000 server error are
    // provider hiccups worth retrying elsewhere.
    if transient_text || code == -32603 || code == -32000 {
        IndexerError::TransientRpc(format!("RPC error {}: {}", code, message))
    } else {
        IndexerError::PermanentRpc(format!("RPC error {}: {}", code, message))
    }
}

/// Provider phrasings for "result set too large".
pub fn is_overflow_message(lower: &str) -> bool {
    lower.contains("more than")
        || lower.contains("query returned more")
        || lower.contains("response size exceeded")
        || lower.contains("too many results")
        || lower.contains("log response size")
}
