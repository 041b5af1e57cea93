//! `reverie-gateway` – The Front Desk.
//!
//! Exposes the [`Engine`][reverie_runtime::Engine] over a single TCP port
//! (default `8787`):
//!
//! 1. **WebSocket** clients send tagged JSON requests (`pattern_query`,
//!    `cluster_query`, `subscribe`, `schema`) and receive tagged JSON
//!    responses.  After `subscribe`, engine events of that user are pushed
//!    as `event` frames.
//! 2. **Plain HTTP** requests on any path get a JSON health document.
//!
//! [`protocol::handle_request`] is transport-free, so the same dispatch can
//! be reused by other front ends.

pub mod protocol;
pub mod server;

pub use protocol::{Request, Response, handle_request};
pub use server::{DEFAULT_PORT, GatewayError, GatewayServer, serve};
