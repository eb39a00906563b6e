//! HTTP control endpoints.
//!
//! - `POST /indexer/start` -> 202 `{sessionId}` | 409 `AlreadyRunning`
//! - `POST /indexer/stop/{sessionId}` -> 200 `{acknowledged:true}`
//! - `GET  /indexer/status/{sessionId}` -> 200 `SessionView`
//! - `GET  /indexer/sessions?user={userId}` -> 200 `[SessionView]`
//! - `GET  /health` -> 200/503 `HealthSnapshot`

use crate::error::IndexerError;
use crate::health::{HealthMonitor, HealthStatus};
use crate::manager::SessionManager;
use chain_common::ChainId;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub health: Arc<HealthMonitor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    contract_address: String,
    chain: String,
    #[serde(default)]
    user_id: Option<String>,
}

/// Run the control API until the process exits.
pub async fn serve(bind: &str, state: ApiState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });

    info!("control API listening on http://{}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

async fn route(req: Request<Body>, state: ApiState) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (&method, path.as_str()) {
        (&Method::POST, "/indexer/start") => handle_start(req, &state).await,
        (&Method::GET, "/health") => handle_health(&state),
        (&Method::GET, "/indexer/sessions") => handle_list(req, &state).await,
        _ => {
            if let (&Method::POST, Some(id)) = (&method, path.strip_prefix("/indexer/stop/")) {
                handle_stop(id, &state).await
            } else if let (&Method::GET, Some(id)) =
                (&method, path.strip_prefix("/indexer/status/"))
            {
                handle_status(id, &state).await
            } else {
                Ok(json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": {"code": "not-found", "message": "no such route"}}),
                ))
            }
        }
    };

    result.unwrap_or_else(|err| error_response(&err))
}

async fn handle_start(
    req: Request<Body>,
    state: &ApiState,
) -> Result<Response<Body>, IndexerError> {
    let header_user = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| IndexerError::InvalidRequest(format!("unreadable body: {}", e)))?;
    let request: StartRequest = serde_json::from_slice(&body)
        .map_err(|e| IndexerError::InvalidRequest(format!("malformed body: {}", e)))?;

    let user_id = request
        .user_id
        .or(header_user)
        .ok_or_else(|| IndexerError::InvalidRequest("missing user id".to_string()))?;
    let chain = ChainId::from_str(&request.chain)
        .ok_or_else(|| IndexerError::InvalidRequest(format!("unknown chain '{}'", request.chain)))?;

    let session_id = state
        .manager
        .start(&user_id, &request.contract_address, chain)
        .await?;
    Ok(json_response(
        StatusCode::ACCEPTED,
        json!({ "sessionId": session_id }),
    ))
}

async fn handle_stop(id: &str, state: &ApiState) -> Result<Response<Body>, IndexerError> {
    state.manager.stop(id).await?;
    Ok(json_response(
        StatusCode::OK,
        json!({ "acknowledged": true }),
    ))
}

async fn handle_status(id: &str, state: &ApiState) -> Result<Response<Body>, IndexerError> {
    let view = state.manager.status(id).await?;
    let body = serde_json::to_value(&view)
        .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;
    Ok(json_response(StatusCode::OK, body))
}

async fn handle_list(
    req: Request<Body>,
    state: &ApiState,
) -> Result<Response<Body>, IndexerError> {
    let user = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("user=").map(String::from))
        })
        .ok_or_else(|| IndexerError::InvalidRequest("missing user parameter".to_string()))?;

    let views = state.manager.list_by_user(&user).await?;
    let body = serde_json::to_value(&views)
        .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;
    Ok(json_response(StatusCode::OK, body))
}

fn handle_health(state: &ApiState) -> Result<Response<Body>, IndexerError> {
    let snapshot = state.health.snapshot(&state.manager);
    let status = match snapshot.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let body = serde_json::to_value(&snapshot)
        .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;
    Ok(json_response(status, body))
}

fn error_response(err: &IndexerError) -> Response<Body> {
    let status = match err {
        IndexerError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        IndexerError::ContractLimit { .. } => StatusCode::FORBIDDEN,
        IndexerError::UnknownSession(_) => StatusCode::NOT_FOUND,
        IndexerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        IndexerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({ "error": err.to_payload() });
    if let IndexerError::AlreadyRunning { session_id } = err {
        body["sessionId"] = json!(session_id);
    }
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {}", err);
    }
    json_response(status, body)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let conflict = error_response(&IndexerError::AlreadyRunning {
            session_id: "s1".into(),
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let missing = error_response(&IndexerError::UnknownSession("x".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let limit = error_response(&IndexerError::ContractLimit {
            tier: "free".into(),
            max: 5,
        });
        assert_eq!(limit.status(), StatusCode::FORBIDDEN);

        let bad = error_response(&IndexerError::InvalidRequest("nope".into()));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_start_request_parsing() {
        let parsed: StartRequest = serde_json::from_value(json!({
            "contractAddress": "0xAE",
            "chain": "lisk",
        }))
        .unwrap();
        assert_eq!(parsed.contract_address, "0xAE");
        assert!(parsed.user_id.is_none());

        let with_user: StartRequest = serde_json::from_value(json!({
            "contractAddress": "0xAE",
            "chain": "ethereum",
            "userId": "u1",
        }))
        .unwrap();
        assert_eq!(with_user.user_id.as_deref(), Some("u1"));
    }
}
