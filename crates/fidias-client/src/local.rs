//! In-process network
//!
//! Hosts register an [`RpcHandler`] under their address; a
//! [`LocalTransport`] dispatches to it directly after pushing the request
//! and response through the wire codec, so serialization bugs surface in
//! single-process clusters as well. Hosts can be partitioned to simulate
//! failures.

use crate::transport::{RpcHandler, Transport};
use async_trait::async_trait;
use fidias_common::{Error, Result};
use fidias_proto::{Request, Response, decode_body, encode_body};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Registry of in-process hosts
#[derive(Default)]
pub struct LocalNetwork {
    hosts: RwLock<HashMap<String, Weak<dyn RpcHandler>>>,
    partitioned: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` as `host`
    pub fn register(&self, host: &str, handler: &Arc<dyn RpcHandler>) {
        self.hosts.write().insert(host.to_string(), Arc::downgrade(handler));
    }

    /// Remove `host`
    pub fn unregister(&self, host: &str) {
        self.hosts.write().remove(host);
    }

    /// Make `host` unreachable in both directions
    pub fn partition(&self, host: &str) {
        self.partitioned.write().insert(host.to_string());
    }

    /// Undo [`Self::partition`]
    pub fn heal(&self, host: &str) {
        self.partitioned.write().remove(host);
    }

    fn resolve(&self, from: &str, host: &str) -> Result<Arc<dyn RpcHandler>> {
        {
            let partitioned = self.partitioned.read();
            if partitioned.contains(host) || partitioned.contains(from) {
                return Err(Error::transport(host, "partitioned"));
            }
        }
        self.hosts
            .read()
            .get(host)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::transport(host, "connection refused"))
    }

    /// Transport for calls originating at `from`
    #[must_use]
    pub fn transport(self: &Arc<Self>, from: &str) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            from: from.to_string(),
            closed: AtomicBool::new(false),
        }
    }
}

/// [`Transport`] over a [`LocalNetwork`]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: String,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, host: &str, request: Request, timeout: Duration) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportShutdown);
        }
        let handler = self.network.resolve(&self.from, host)?;
        trace!("{} -> {}: {}", self.from, host, request.method());
        let request: Request = decode_body(&encode_body(&request)?)?;
        let response = tokio::time::timeout(timeout, handler.handle(request))
            .await
            .map_err(|_| Error::Timeout)?;
        decode_body(&encode_body(&response)?)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl RpcHandler for Fixed {
        async fn handle(&self, _request: Request) -> Response {
            Response::File(self.0.as_bytes().to_vec())
        }
    }

    fn ping() -> Request {
        Request::GetFile { name: "f".into() }
    }

    #[tokio::test]
    async fn test_dispatch_and_partition() {
        let net = LocalNetwork::new();
        let a: Arc<dyn RpcHandler> = Arc::new(Fixed("a"));
        net.register("a:1", &a);
        let t = net.transport("b:1");
        let resp = t.call("a:1", ping(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp, Response::File(b"a".to_vec()));

        net.partition("a:1");
        let err = t.call("a:1", ping(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Transport { ref host, .. } if host == "a:1"));
        net.heal("a:1");
        assert!(t.call("a:1", ping(), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unreachable() {
        let net = LocalNetwork::new();
        let a: Arc<dyn RpcHandler> = Arc::new(Fixed("a"));
        net.register("a:1", &a);
        drop(a);
        let t = net.transport("b:1");
        assert!(t.call("a:1", ping(), Duration::from_secs(1)).await.is_err());
        t.shutdown().await;
        assert!(matches!(
            t.call("a:1", ping(), Duration::from_secs(1)).await,
            Err(Error::TransportShutdown)
        ));
    }
}
