//! Process metrics and the Prometheus exporter.

use anyhow::Result;
use chain_common::ChainId;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus exporter and register metric descriptions.
pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_counter!("rpc_calls_total", "Total JSON-RPC calls issued");
    describe_counter!("rpc_failures_total", "Total failed JSON-RPC attempts");
    describe_counter!("chunks_completed_total", "Chunks fetched and persisted");
    describe_counter!("chunk_splits_total", "Chunk halvings caused by provider overflow");
    describe_counter!("chunk_retries_total", "Chunk re-queues after transient failures");
    describe_counter!("sessions_started_total", "Indexing sessions accepted");
    describe_counter!("sessions_completed_total", "Sessions that reached completion");
    describe_counter!("sessions_failed_total", "Sessions that ended in failure");
    describe_counter!("progress_events_total", "Progress events published");
    describe_gauge!("active_sessions", "Sessions currently in a non-terminal state");

    info!("metrics exporter listening on http://0.0.0.0:{}/metrics", port);
    Ok(())
}

/// Metrics helper functions. All recorders are no-ops until `init_metrics`
/// installs the exporter, so the library is free to call them in tests.
pub struct Metrics;

impl Metrics {
    pub fn rpc_call(chain: ChainId) {
        counter!("rpc_calls_total", "chain" => chain.as_str()).increment(1);
    }

    pub fn rpc_failure(chain: ChainId) {
        counter!("rpc_failures_total", "chain" => chain.as_str()).increment(1);
    }

    pub fn chunk_completed() {
        counter!("chunks_completed_total").increment(1);
    }

    pub fn chunk_split() {
        counter!("chunk_splits_total").increment(1);
    }

    pub fn chunk_retry() {
        counter!("chunk_retries_total").increment(1);
    }

    pub fn session_started() {
        counter!("sessions_started_total").increment(1);
    }

    pub fn session_completed() {
        counter!("sessions_completed_total").increment(1);
    }

    pub fn session_failed() {
        counter!("sessions_failed_total").increment(1);
    }

    pub fn progress_event() {
        counter!("progress_events_total").increment(1);
    }

    pub fn update_active_sessions(count: usize) {
        gauge!("active_sessions").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_without_exporter() {
        Metrics::rpc_call(ChainId::Ethereum);
        Metrics::rpc_failure(ChainId::Starknet);
        Metrics::chunk_completed();
        Metrics::chunk_split();
        Metrics::session_started();
        Metrics::session_completed();
        Metrics::session_failed();
        Metrics::progress_event();
        Metrics::update_active_sessions(3);
    }
}
