//! TCP transport and server loop
//!
//! One request/response exchange at a time per pooled connection; the
//! pool provides the concurrency.

use crate::pool::ConnPool;
use crate::transport::{RpcHandler, Transport};
use async_trait::async_trait;
use fidias_common::config::TransportConfig;
use fidias_common::{Error, Result};
use fidias_proto::{FrameKind, Request, Response, decode_body, encode_body, read_frame, write_frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// [`Transport`] over pooled TCP connections
pub struct TcpTransport {
    pool: Arc<ConnPool>,
    max_frame: usize,
    next_id: AtomicU64,
}

impl TcpTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let max_frame = config.max_frame_size;
        Self {
            pool: Arc::new(ConnPool::new(config)),
            max_frame,
            next_id: AtomicU64::new(1),
        }
    }

    /// Connection pool behind this transport
    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }

    async fn exchange(&self, host: &str, request: &Request) -> Result<Response> {
        let body = encode_body(request)?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.pool.checkout(host).await?;
        let result = async {
            write_frame(&mut conn.stream, FrameKind::Request, request_id, &body).await?;
            let (header, body) = read_frame(&mut conn.stream, self.max_frame).await?;
            if header.kind != FrameKind::Response || header.request_id != request_id {
                return Err(Error::Serialization(format!(
                    "unexpected frame {:?}#{} (wanted response #{request_id})",
                    header.kind, header.request_id
                )));
            }
            decode_body::<Response>(&body)
        }
        .await;
        match result {
            Ok(response) => {
                self.pool.checkin(host, conn).await;
                Ok(response)
            }
            // The connection is in an unknown state; drop it
            Err(Error::Io(e)) => Err(Error::transport(host, e)),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, host: &str, request: Request, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, self.exchange(host, &request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{} to {} timed out after {:?}", request.method(), host, timeout);
                Err(Error::Timeout)
            }
        }
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Accept connections on `listener` and dispatch frames to `handler` until
/// `cancel` fires
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    max_frame: usize,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("RPC server listening on {}", addr),
        Err(e) => warn!("RPC server listening on unknown address: {}", e),
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(stream, handler, max_frame, cancel).await {
                            debug!("Connection from {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    info!("RPC server stopped");
}

async fn serve_conn(
    mut stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    max_frame: usize,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let (header, body) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream, max_frame) => frame?,
        };
        if header.kind != FrameKind::Request {
            return Err(Error::Serialization("expected a request frame".into()));
        }
        let response = match decode_body::<Request>(&body) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Response::error(&e),
        };
        let body = encode_body(&response)?;
        write_frame(&mut stream, FrameKind::Response, header.request_id, &body).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fidias_common::KvPair;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::GetKey { key } if key == "missing" => {
                    Response::error(&Error::KeyNotFound(key))
                }
                Request::GetKey { key } => Response::Kv(KvPair {
                    key,
                    value: b"v".to_vec(),
                    ..KvPair::default()
                }),
                Request::LastEntry { .. } => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Response::Ok
                }
                _ => Response::Ok,
            }
        }
    }

    async fn server() -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo), 1 << 20, cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn test_call_roundtrip_and_reuse() {
        let (addr, cancel) = server().await;
        let transport = TcpTransport::new(TransportConfig::default());
        for _ in 0..3 {
            let resp = transport
                .call(&addr, Request::GetKey { key: "a".into() }, Duration::from_secs(5))
                .await
                .unwrap();
            assert!(matches!(resp, Response::Kv(kv) if kv.key == "a"));
        }
        assert_eq!(transport.pool().idle_count(&addr).await, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_error_response_and_timeout() {
        let (addr, cancel) = server().await;
        let transport = TcpTransport::new(TransportConfig::default());
        let resp = transport
            .call(&addr, Request::GetKey { key: "missing".into() }, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(resp.into_result(), Err(Error::KeyNotFound(_))));
        let slow = transport
            .call(&addr, Request::LastEntry { key: b"k".to_vec() }, Duration::from_millis(50))
            .await;
        assert!(matches!(slow, Err(Error::Timeout)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let (addr, cancel) = server().await;
        let transport = TcpTransport::new(TransportConfig::default());
        transport.shutdown().await;
        let res = transport
            .call(&addr, Request::GetKey { key: "a".into() }, Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(Error::TransportShutdown)));
        cancel.cancel();
    }
}
