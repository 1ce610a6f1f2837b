// src/handlers/connect.rs
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use corral::dialer::tunnel::{authorize, NODE_HEADER, TOKEN_HEADER};
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::server::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// GET /v3/connect: agents open a tunnel with their registration token.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let token = header(&headers, TOKEN_HEADER).unwrap_or_default();
    let node = header(&headers, NODE_HEADER);
    let key = authorize(&state.registration_tokens, token, node).await?;
    info!(session = %key, "agent tunnel authorized");

    Ok(ws.on_upgrade(move |socket| serve_tunnel(state, key, socket)))
}

async fn serve_tunnel(state: Arc<AppState>, key: String, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let incoming = stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(bytes)) => Some(bytes.to_vec()),
                _ => None,
            })
        });
    let outgoing = sink.with(|bytes: Vec<u8>| future::ready(Ok::<_, axum::Error>(Message::Binary(bytes.into()))));

    state
        .tunnels
        .serve(&key, Box::pin(incoming), Box::pin(outgoing))
        .await;
}
