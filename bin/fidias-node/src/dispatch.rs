//! RPC dispatch: routes each request to the subsystem that serves it

use crate::membership::check_joiner;
use crate::node::FidiasNode;
use async_trait::async_trait;
use fidias_client::RpcHandler;
use fidias_common::Result;
use fidias_proto::{Request, Response};
use fidias_rebalance::FetchRequest;
use std::time::Instant;
use tracing::{debug, info};

impl FidiasNode {
    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::GetKey { .. }
            | Request::ListDir { .. }
            | Request::SetKv { .. }
            | Request::CaSetKv { .. }
            | Request::RemoveKv { .. }
            | Request::CaRemoveKv { .. } => self.kv.handle(request).await,

            Request::SetBlock { .. }
            | Request::GetBlock { .. }
            | Request::RemoveBlock { .. }
            | Request::PublishBlock { .. } => self.device.handle(request),

            Request::GetFile { .. } => self.fs.handle(request),

            Request::TransferKeylog { source, key } => {
                self.fetcher
                    .enqueue(FetchRequest {
                        source,
                        key,
                        marker: None,
                    })
                    .await?;
                Ok(Response::Ok)
            }
            Request::Relocate { preamble, tuples } => {
                let queued = self.fetcher.accept_relocate(&preamble, tuples).await?;
                debug!("Relocate from {} queued {} pulls", preamble.source, queued);
                Ok(Response::Ok)
            }

            Request::PingNode { from, ltime, .. } => {
                let clock = self.wal.clock();
                clock.witness(ltime);
                debug!("Ping from {}", from);
                Ok(Response::Pong {
                    ltime: clock.increment(),
                    coordinate: self.ring.coordinate(),
                })
            }
            Request::Join { node } => {
                check_joiner(&self.ring, &node)?;
                let address = node.address.clone();
                if self.ring.join(node) {
                    info!("{} joined through this node", address);
                }
                Ok(Response::Members(self.ring.snapshot().nodes().cloned().collect()))
            }
            Request::Leave { host } => {
                self.ring.leave(&host);
                Ok(Response::Ok)
            }

            other => self.wal.handle_log(other).await,
        }
    }
}

#[async_trait]
impl RpcHandler for FidiasNode {
    async fn handle(&self, request: Request) -> Response {
        let method = request.method();
        let start = Instant::now();
        let result = self.dispatch(request).await;
        self.metrics.record(method, result.is_ok(), start.elapsed());
        result.into()
    }
}
