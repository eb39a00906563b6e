//! WebSocket progress stream.
//!
//! `GET /indexer/stream/{sessionId}` upgrades to a WebSocket that carries
//! one JSON `ProgressEvent` per text frame and closes after the terminal
//! event. Subscription starts at connect time; nothing is backfilled — a
//! client that wants history reads the status endpoint first.

use crate::manager::SessionManager;
use crate::publisher::ProgressPublisher;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct StreamState {
    pub manager: Arc<SessionManager>,
    pub publisher: Arc<ProgressPublisher>,
}

/// Run the stream listener until the process exits.
pub async fn serve(bind: &str, state: StreamState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let listener = TcpListener::bind(&addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(listener: TcpListener, state: StreamState) -> anyhow::Result<()> {
    info!(
        "progress stream listening on ws://{}",
        listener.local_addr()?
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, state).await {
                        debug!("stream connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("stream accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: StreamState,
) -> anyhow::Result<()> {
    let mut path = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = Some(req.uri().path().to_string());
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let session_id = match path.as_deref().and_then(parse_stream_path) {
        Some(id) => id,
        None => {
            warn!("stream request from {} with invalid path {:?}", peer_addr, path);
            close(ws_stream).await;
            return Ok(());
        }
    };

    // Subscribe before the status check so no event can slip between them.
    let mut events = state.publisher.subscribe(&session_id);
    let known = match state.manager.status(&session_id).await {
        Ok(view) => !view.state.is_terminal(),
        Err(_) => false,
    };
    if !known {
        debug!(
            "stream request from {} for unknown or finished session {}",
            peer_addr, session_id
        );
        close(ws_stream).await;
        return Ok(());
    }

    info!("stream subscriber {} attached to {}", peer_addr, session_id);
    let (mut sink, mut source) = ws_stream.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        let frame = serde_json::to_string(&event)?;
                        sink.send(Message::Text(frame)).await?;
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Drain the client side so pings and close frames are handled.
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("stream subscriber {} left {}", peer_addr, session_id);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("stream subscriber {} errored: {}", peer_addr, e);
                        return Ok(());
                    }
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

fn parse_stream_path(path: &str) -> Option<String> {
    let id = path.strip_prefix("/indexer/stream/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

async fn close(ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>) {
    let (mut sink, _) = ws_stream.split();
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_path() {
        assert_eq!(
            parse_stream_path("/indexer/stream/abc-123"),
            Some("abc-123".to_string())
        );
        assert_eq!(parse_stream_path("/indexer/stream/"), None);
        assert_eq!(parse_stream_path("/indexer/stream/a/b"), None);
        assert_eq!(parse_stream_path("/other"), None);
    }
}
