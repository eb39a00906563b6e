//! Pool-level failover and circuit breaker behaviour against mock
//! JSON-RPC endpoints.

use chain_common::ChainId;
use contract_indexer::config::IndexerConfig;
use contract_indexer::error::IndexerError;
use contract_indexer::rpc::{CallOptions, EndpointState, RpcClientPool};
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rpc_result(value: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": value,
    }))
}

fn pool_config(urls: Vec<String>) -> IndexerConfig {
    let mut config = IndexerConfig::default();
    config.endpoints.insert(ChainId::Ethereum, urls);
    config.request_timeout = Duration::from_millis(250);
    config.rpc_max_retries = 1;
    config.circuit_failure_threshold = 2;
    config.circuit_cooldown = Duration::from_millis(400);
    config.endpoint_qps = 1_000;
    // Keep probes out of the way; these tests drive the pool directly.
    config.health_probe_interval = Duration::from_secs(3_600);
    config
}

#[tokio::test]
async fn failover_skips_timing_out_endpoint() {
    let slow = MockServer::start().await;
    let fast = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(rpc_result("0xdead").set_delay(Duration::from_secs(5)))
        .mount(&slow)
        .await;
    Mock::given(method("POST"))
        .respond_with(rpc_result("0x10"))
        .mount(&fast)
        .await;

    let pool = RpcClientPool::new(&pool_config(vec![slow.uri(), fast.uri()]));
    let opts = CallOptions::default();

    // First call times out on the priority endpoint, fails over, and
    // returns the second endpoint's result.
    let result = pool
        .call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap();
    assert_eq!(result, json!("0x10"));

    // Second call opens the slow endpoint's circuit (threshold 2).
    pool.call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap();

    let health = pool.health();
    assert_eq!(health.len(), 1);
    let slow_state = health[0]
        .endpoints
        .iter()
        .find(|e| e.url.trim_end_matches('/') == slow.uri().trim_end_matches('/'))
        .map(|e| e.state);
    assert_eq!(slow_state, Some(EndpointState::OpenCircuit));

    // With the circuit open the slow endpoint is skipped entirely.
    let started = Instant::now();
    pool.call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(slow.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn circuit_cooldown_gates_the_probe() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = pool_config(vec![server.uri()]);
    config.circuit_failure_threshold = 1;
    let pool = RpcClientPool::new(&config);
    let opts = CallOptions::default();

    // One 503 opens the circuit.
    let err = pool
        .call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::TransientRpc(_)));

    // Inside the cooldown the endpoint is not tried again.
    let err = pool
        .call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap_err();
    assert_eq!(err, IndexerError::NoHealthyEndpoint(ChainId::Ethereum));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    // After the cooldown the half-open probe goes through; a success
    // restores the endpoint.
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result("0x20"))
        .mount(&server)
        .await;
    tokio::time::sleep(Duration::from_millis(450)).await;

    let result = pool
        .call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
        .await
        .unwrap();
    assert_eq!(result, json!("0x20"));
    assert_eq!(
        pool.health()[0].endpoints[0].state,
        EndpointState::Healthy
    );
}

#[tokio::test]
async fn permanent_errors_do_not_fail_over() {
    let bad = MockServer::start().await;
    let good = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32602, "message": "invalid params" },
        })))
        .mount(&bad)
        .await;
    Mock::given(method("POST"))
        .respond_with(rpc_result("0x1"))
        .mount(&good)
        .await;

    let pool = RpcClientPool::new(&pool_config(vec![bad.uri(), good.uri()]));
    let err = pool
        .call(
            ChainId::Ethereum,
            "eth_getLogs",
            json!([{"fromBlock": "0x0"}]),
            &CallOptions::default(),
        )
        .await
        .unwrap_err();

    // A permanent error fails the call without touching the second
    // endpoint or the breaker.
    assert!(matches!(err, IndexerError::PermanentRpc(_)));
    assert!(good.received_requests().await.unwrap().is_empty());
    assert_eq!(
        pool.health()[0].endpoints[0].state,
        EndpointState::Healthy
    );
}

#[tokio::test]
async fn cancellation_aborts_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result("0x1").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let mut config = pool_config(vec![server.uri()]);
    config.request_timeout = Duration::from_secs(30);
    let pool = RpcClientPool::new(&config);

    let opts = CallOptions::default();
    let cancel = opts.cancel.clone();
    let call = tokio::spawn(async move {
        pool.call(ChainId::Ethereum, "eth_blockNumber", json!([]), &opts)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    cancel.cancel();
    let result = call.await.unwrap();
    assert_eq!(result.unwrap_err(), IndexerError::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(200));
}
