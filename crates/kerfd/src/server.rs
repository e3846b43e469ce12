//! HTTP surface: the websocket upgrade endpoint and a health probe.
//!
//! Token verification happens before the upgrade completes — an
//! invalid or missing token is rejected with 401 and no tunnel bytes
//! are ever exchanged. The verified claims become the session's
//! authorization snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use kerf_core::auth::verify_token;
use kerf_core::wire::MAX_WIRE_FRAME;

use crate::attest::AttestationProvider;
use crate::handler::RouteTable;
use crate::session::connection::{self, ConnectionConfig};
use crate::session::{CloseReason, MessageSink, MessageSource, TransportError};
use crate::stream::StreamLimits;

/// Shared gateway state, installed once at startup.
#[derive(Clone)]
pub struct GatewayState {
    pub attest: Arc<dyn AttestationProvider>,
    pub routes: Arc<RouteTable>,
    pub limits: StreamLimits,
    pub token_secret: Arc<Vec<u8>>,
}

pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/tunnel", get(tunnel))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: GatewayState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, routes = state.routes.len(), "kerfd listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn tunnel(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    let Some(token) = params.get("token") else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let auth = match verify_token(token, &state.token_secret) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::debug!(error = %e, "tunnel token rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.max_message_size(MAX_WIRE_FRAME)
        .on_upgrade(move |socket| async move {
            let (ws_sink, ws_source) = socket.split();
            let config = ConnectionConfig {
                attest: state.attest,
                routes: state.routes,
                limits: state.limits,
                auth,
            };
            connection::run(WsSource(ws_source), WsSink(ws_sink), config).await;
        })
}

// ── Websocket transport adapters ──────────────────────────────────────────────

struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        while let Some(item) = self.0.next().await {
            match item {
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes.to_vec())),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                // The tunnel is binary-only; a text frame is protocol abuse.
                Ok(Message::Text(_)) => {
                    return Some(Err(TransportError("text frame on binary tunnel".into())))
                }
                Err(e) => return Some(Err(TransportError(e.to_string()))),
            }
        }
        None
    }
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(message.into()))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: reason.code(),
            reason: reason.as_str().into(),
        };
        let _ = self.0.send(Message::Close(Some(frame))).await;
        let _ = self.0.close().await;
    }
}
