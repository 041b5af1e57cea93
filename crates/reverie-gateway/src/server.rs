//! [`GatewayServer`] – HTTP + WebSocket front end of the [`Engine`].
//!
//! Listens on `0.0.0.0:8787` (configurable via [`GatewayServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with a JSON health document.
//! * WebSocket upgrades → request/response frames per
//!   [`protocol`][crate::protocol], plus pushed engine events for subscribed
//!   users.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use reverie_runtime::Engine;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::{Response, handle_request};

/// Default TCP port of the gateway.
pub const DEFAULT_PORT: u16 = 8787;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("bind error on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// GatewayServer
// ─────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use reverie_gateway::GatewayServer;
/// use reverie_memory::MemoryStore;
/// use reverie_runtime::{Engine, EngineConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(MemoryStore::open("reverie.db", 768).unwrap());
///     let engine = Engine::new(store, EngineConfig::default()).unwrap();
///     GatewayServer::new(engine).run().await.unwrap();
/// }
/// ```
pub struct GatewayServer {
    engine: Engine,
    port: u16,
}

impl GatewayServer {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<(), GatewayError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), GatewayError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        info!(port = self.port, "gateway listening on http://localhost:{}", self.port);
        serve(listener, self.engine, shutdown).await;
        Ok(())
    }
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve(listener: TcpListener, engine: Engine, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, engine).await {
                            warn!(%peer, error = %e, "client error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            },
            _ = &mut shutdown => {
                info!("gateway shutting down");
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-connection handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<(), GatewayError> {
    // `peek` leaves the request in the socket for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream.peek(&mut buf).await?;
    if is_websocket_upgrade(&String::from_utf8_lossy(&buf[..n])) {
        handle_ws(stream, peer, engine).await
    } else {
        serve_health(stream, &engine).await
    }
}

pub(crate) fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

pub(crate) fn health_body(engine: &Engine) -> String {
    json!({
        "status": "ok",
        "service": "reverie-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "dimensions": engine.config().dimensions,
        "pendingRetries": engine.pending_retries().total(),
    })
    .to_string()
}

async fn serve_health(mut stream: TcpStream, engine: &Engine) -> Result<(), GatewayError> {
    let body = health_body(engine);
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket session
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws(stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<(), GatewayError> {
    let ws_stream = accept_async(stream).await?;
    debug!(%peer, "websocket session opened");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut events = engine.subscribe();
    let mut subscriptions: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            result = events.recv() => match result {
                Ok(event) if subscriptions.contains(event.user_id()) => {
                    let frame = Response::Event { event }.to_json();
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(%peer, skipped = n, "subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let response = handle_request(&engine, text.as_str()).await;
                    if let Response::Subscribed { user_id } = &response {
                        subscriptions.insert(user_id.clone());
                    }
                    if ws_tx.send(Message::Text(response.to_json().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "websocket read error");
                    break;
                }
                _ => {}
            },
        }
    }
    debug!(%peer, "websocket session closed");
    Ok(())
}
