//! Configuration loaded from environment variables with per-field defaults.
//!
//! Endpoint lists come from `{ETHEREUM,LISK,STARKNET}_RPC_URL{1,2,3}`;
//! everything else has a sensible default and a dedicated override variable.

use chain_common::ChainId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Service-wide configuration.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Ordered RPC endpoints per chain, highest priority first.
    pub endpoints: HashMap<ChainId, Vec<String>>,

    /// Token-bucket capacity per endpoint, in requests per second.
    pub endpoint_qps: u32,

    /// Per-call HTTP timeout.
    pub request_timeout: Duration,

    // Chunking
    pub chunk_size_blocks: u64,
    pub chunk_floor_blocks: u64,
    pub max_chunk_attempts: u32,

    // Pool retry schedule
    pub rpc_max_retries: u32,
    pub rpc_base_delay: Duration,
    pub rpc_max_delay: Duration,

    // Circuit breaker
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub circuit_cooldown_cap: Duration,

    // Background probes
    pub health_probe_interval: Duration,

    // Sessions
    /// Overrides the tier-derived hard deadline when set.
    pub session_hard_deadline: Option<Duration>,
    pub stale_session_after: Duration,

    // Surfaces
    pub http_bind: String,
    pub stream_bind: String,
    pub metrics_port: u16,

    /// Directory for the file-backed repository; `None` keeps records in
    /// memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            endpoint_qps: 10,
            request_timeout: Duration::from_secs(10),
            chunk_size_blocks: 200_000,
            chunk_floor_blocks: 1_000,
            max_chunk_attempts: 5,
            rpc_max_retries: 3,
            rpc_base_delay: Duration::from_millis(2_000),
            rpc_max_delay: Duration::from_millis(30_000),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_millis(30_000),
            circuit_cooldown_cap: Duration::from_secs(600),
            health_probe_interval: Duration::from_secs(30),
            session_hard_deadline: None,
            stale_session_after: Duration::from_secs(300),
            http_bind: "0.0.0.0:8080".to_string(),
            stream_bind: "0.0.0.0:8081".to_string(),
            metrics_port: 9090,
            data_dir: None,
        }
    }
}

impl IndexerConfig {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            endpoints: endpoints_from_env(),
            endpoint_qps: env_parse("RPC_ENDPOINT_QPS", default.endpoint_qps),
            request_timeout: Duration::from_millis(env_parse(
                "RPC_REQUEST_TIMEOUT_MS",
                default.request_timeout.as_millis() as u64,
            )),
            chunk_size_blocks: env_parse("CHUNK_SIZE_BLOCKS", default.chunk_size_blocks),
            chunk_floor_blocks: env_parse("CHUNK_FLOOR_BLOCKS", default.chunk_floor_blocks),
            max_chunk_attempts: env_parse("MAX_CHUNK_ATTEMPTS", default.max_chunk_attempts),
            rpc_max_retries: env_parse("RPC_MAX_RETRIES", default.rpc_max_retries),
            rpc_base_delay: Duration::from_millis(env_parse(
                "RPC_BASE_DELAY_MS",
                default.rpc_base_delay.as_millis() as u64,
            )),
            rpc_max_delay: Duration::from_millis(env_parse(
                "RPC_MAX_DELAY_MS",
                default.rpc_max_delay.as_millis() as u64,
            )),
            circuit_failure_threshold: env_parse(
                "CIRCUIT_FAILURE_THRESHOLD",
                default.circuit_failure_threshold,
            ),
            circuit_cooldown: Duration::from_millis(env_parse(
                "CIRCUIT_COOLDOWN_MS",
                default.circuit_cooldown.as_millis() as u64,
            )),
            circuit_cooldown_cap: Duration::from_millis(env_parse(
                "CIRCUIT_COOLDOWN_CAP_MS",
                default.circuit_cooldown_cap.as_millis() as u64,
            )),
            health_probe_interval: Duration::from_millis(env_parse(
                "HEALTH_PROBE_INTERVAL_MS",
                default.health_probe_interval.as_millis() as u64,
            )),
            session_hard_deadline: std::env::var("SESSION_HARD_DEADLINE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            stale_session_after: Duration::from_millis(env_parse(
                "STALE_SESSION_AFTER_MS",
                default.stale_session_after.as_millis() as u64,
            )),
            http_bind: std::env::var("INDEXER_HTTP_BIND").unwrap_or(default.http_bind),
            stream_bind: std::env::var("INDEXER_STREAM_BIND").unwrap_or(default.stream_bind),
            metrics_port: env_parse("METRICS_PORT", default.metrics_port),
            data_dir: std::env::var("INDEXER_DATA_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn endpoints_for(&self, chain: ChainId) -> &[String] {
        self.endpoints.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read `{CHAIN}_RPC_URL1..3` for every supported chain. Gaps in the
/// numbering are skipped, so `URL1` + `URL3` yields two endpoints.
fn endpoints_from_env() -> HashMap<ChainId, Vec<String>> {
    let mut endpoints = HashMap::new();
    for chain in ChainId::ALL {
        let prefix = chain.as_str().to_uppercase();
        let urls: Vec<String> = (1..=3)
            .filter_map(|n| std::env::var(format!("{}_RPC_URL{}", prefix, n)).ok())
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if !urls.is_empty() {
            endpoints.insert(chain, urls);
        }
    }
    endpoints
}
