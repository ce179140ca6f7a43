//! Typed RPC client
//!
//! Wraps a [`Transport`] with one method per request, unwrapping error
//! responses into sentinel errors and checking the response variant.

use crate::transport::SharedTransport;
use fidias_common::{
    BallotResult, Block, Coordinate, Entry, Error, Id, KeyIndex, KvPair, Node, ProposeOptions,
    RelocateTuple, Result, WriteOptions, WriteStats,
};
use fidias_proto::{RelocatePreamble, Request, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn unexpected(method: &str, resp: &Response) -> Error {
    Error::internal(format!("unexpected {} response to {}", resp.kind(), method))
}

/// Client for peer RPCs
#[derive(Clone)]
pub struct RpcClient {
    transport: SharedTransport,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(
        transport: SharedTransport,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            read_timeout,
            write_timeout,
        }
    }

    /// Underlying transport
    #[must_use]
    pub const fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Send a request with the default deadline for its kind
    pub async fn call(&self, host: &str, request: Request) -> Result<Response> {
        let timeout = if request.is_write() {
            self.write_timeout
        } else {
            self.read_timeout
        };
        self.transport.call(host, request, timeout).await?.into_result()
    }

    /// Like [`Self::call`] but abandons the request when `cancel` fires
    pub async fn call_with_cancel(
        &self,
        host: &str,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            resp = self.call(host, request) => resp,
        }
    }

    // KV

    pub async fn get_key(&self, host: &str, key: &str) -> Result<KvPair> {
        match self.call(host, Request::GetKey { key: key.to_string() }).await? {
            Response::Kv(kv) => Ok(kv),
            other => Err(unexpected("GetKey", &other)),
        }
    }

    pub async fn list_dir(&self, host: &str, prefix: &str) -> Result<Vec<KvPair>> {
        match self.call(host, Request::ListDir { prefix: prefix.to_string() }).await? {
            Response::KvList(list) => Ok(list),
            other => Err(unexpected("ListDir", &other)),
        }
    }

    async fn kv_write(&self, host: &str, request: Request) -> Result<(KvPair, WriteStats)> {
        let method = request.method();
        match self.call(host, request).await? {
            Response::KvWrite { kv, stats } => Ok((kv, stats)),
            other => Err(unexpected(method, &other)),
        }
    }

    pub async fn set_kv(
        &self,
        host: &str,
        kv: KvPair,
        options: WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.kv_write(host, Request::SetKv { kv, options }).await
    }

    pub async fn ca_set_kv(
        &self,
        host: &str,
        kv: KvPair,
        options: WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.kv_write(host, Request::CaSetKv { kv, options }).await
    }

    pub async fn remove_kv(
        &self,
        host: &str,
        key: &str,
        options: WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.kv_write(
            host,
            Request::RemoveKv {
                key: key.to_string(),
                options,
            },
        )
        .await
    }

    pub async fn ca_remove_kv(
        &self,
        host: &str,
        kv: KvPair,
        options: WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.kv_write(host, Request::CaRemoveKv { kv, options }).await
    }

    // Log

    pub async fn get_entry(&self, host: &str, key: &[u8], id: &Id) -> Result<Entry> {
        let req = Request::GetEntry {
            key: key.to_vec(),
            id: id.clone(),
        };
        match self.call(host, req).await? {
            Response::Entry(e) => Ok(e),
            other => Err(unexpected("GetEntry", &other)),
        }
    }

    pub async fn last_entry(&self, host: &str, key: &[u8]) -> Result<Entry> {
        match self.call(host, Request::LastEntry { key: key.to_vec() }).await? {
            Response::Entry(e) => Ok(e),
            other => Err(unexpected("LastEntry", &other)),
        }
    }

    pub async fn get_index(&self, host: &str, key: &[u8]) -> Result<KeyIndex> {
        match self.call(host, Request::GetIndex { key: key.to_vec() }).await? {
            Response::Index(idx) => Ok(idx),
            other => Err(unexpected("GetIndex", &other)),
        }
    }

    /// Up to `limit` entries following `after` (zero id: from the start)
    pub async fn fetch_keylog(
        &self,
        host: &str,
        key: &[u8],
        after: &Id,
        limit: u32,
    ) -> Result<Vec<Entry>> {
        let req = Request::FetchKeylog {
            key: key.to_vec(),
            after: after.clone(),
            limit,
        };
        match self.call(host, req).await? {
            Response::Entries(entries) => Ok(entries),
            other => Err(unexpected("FetchKeylog", &other)),
        }
    }

    pub async fn propose_entry(
        &self,
        host: &str,
        entry: Entry,
        options: ProposeOptions,
    ) -> Result<BallotResult> {
        match self.call(host, Request::ProposeEntry { entry, options }).await? {
            Response::Ballot(result) => Ok(result),
            other => Err(unexpected("ProposeEntry", &other)),
        }
    }

    pub async fn ballot_vote(
        &self,
        host: &str,
        entry: Entry,
        options: ProposeOptions,
    ) -> Result<()> {
        match self.call(host, Request::BallotVote { entry, options }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("BallotVote", &other)),
        }
    }

    pub async fn ballot_commit(
        &self,
        host: &str,
        entry: Entry,
        options: ProposeOptions,
    ) -> Result<()> {
        match self.call(host, Request::BallotCommit { entry, options }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("BallotCommit", &other)),
        }
    }

    /// Ask `host` to pull `key` from `source`
    pub async fn transfer_keylog(&self, host: &str, source: &str, key: &[u8]) -> Result<()> {
        let req = Request::TransferKeylog {
            source: source.to_string(),
            key: key.to_vec(),
        };
        match self.call(host, req).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("TransferKeylog", &other)),
        }
    }

    pub async fn relocate(
        &self,
        host: &str,
        preamble: RelocatePreamble,
        tuples: Vec<RelocateTuple>,
    ) -> Result<()> {
        match self.call(host, Request::Relocate { preamble, tuples }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("Relocate", &other)),
        }
    }

    // Blocks

    pub async fn set_block(&self, host: &str, block: Block) -> Result<()> {
        match self.call(host, Request::SetBlock { block }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("SetBlock", &other)),
        }
    }

    pub async fn get_block(&self, host: &str, id: &Id) -> Result<Block> {
        match self.call(host, Request::GetBlock { id: id.clone() }).await? {
            Response::Block(block) => Ok(block),
            other => Err(unexpected("GetBlock", &other)),
        }
    }

    pub async fn remove_block(&self, host: &str, id: &Id) -> Result<()> {
        match self.call(host, Request::RemoveBlock { id: id.clone() }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("RemoveBlock", &other)),
        }
    }

    pub async fn publish_block(&self, host: &str, id: &Id, holder: &str) -> Result<()> {
        let req = Request::PublishBlock {
            id: id.clone(),
            host: holder.to_string(),
        };
        match self.call(host, req).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("PublishBlock", &other)),
        }
    }

    // Membership

    /// Ping `host`; returns its Lamport time and coordinate
    pub async fn ping(
        &self,
        host: &str,
        from: &str,
        ltime: u64,
        coordinate: Coordinate,
    ) -> Result<(u64, Coordinate)> {
        let req = Request::PingNode {
            from: from.to_string(),
            ltime,
            coordinate,
        };
        match self.call(host, req).await? {
            Response::Pong { ltime, coordinate } => Ok((ltime, coordinate)),
            other => Err(unexpected("PingNode", &other)),
        }
    }

    /// Announce `node` to `host`; returns the members `host` knows
    pub async fn join(&self, host: &str, node: Node) -> Result<Vec<Node>> {
        match self.call(host, Request::Join { node }).await? {
            Response::Members(members) => Ok(members),
            other => Err(unexpected("Join", &other)),
        }
    }

    pub async fn leave(&self, host: &str, leaving: &str) -> Result<()> {
        let req = Request::Leave {
            host: leaving.to_string(),
        };
        match self.call(host, req).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("Leave", &other)),
        }
    }

    // Files

    pub async fn get_file(&self, host: &str, name: &str) -> Result<Vec<u8>> {
        match self.call(host, Request::GetFile { name: name.to_string() }).await? {
            Response::File(buf) => Ok(buf),
            other => Err(unexpected("GetFile", &other)),
        }
    }
}
