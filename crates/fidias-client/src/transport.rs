//! Transport and handler seams
//!
//! Services talk to peers through [`Transport`] and receive calls through
//! [`RpcHandler`]. The TCP transport and the in-process network implement
//! the same contract, so every component runs unchanged in tests.

use async_trait::async_trait;
use fidias_common::Result;
use fidias_proto::{Request, Response};
use std::sync::Arc;
use std::time::Duration;

/// Outbound RPC
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `host` and wait for its response.
    ///
    /// Transport failures come back as `Error::Transport` carrying the
    /// host; an expired deadline as `Error::Timeout`. Error responses are
    /// returned as `Response::Error` for the caller to unwrap.
    async fn call(&self, host: &str, request: Request, timeout: Duration) -> Result<Response>;

    /// Close pooled connections; later calls fail with `TransportShutdown`
    async fn shutdown(&self);
}

/// Inbound RPC dispatch
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

pub type SharedTransport = Arc<dyn Transport>;
