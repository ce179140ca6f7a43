//! Block and file behaviour across an in-process cluster

use crate::{BlockDevice, FileSystem, FsFsm, MemBlockStore};
use async_trait::async_trait;
use fidias_client::{LocalNetwork, RpcClient, RpcHandler, SharedTransport};
use fidias_common::config::{BlockConfig, RingConfig, WalConfig};
use fidias_common::{
    Block, BlockKind, Error, HashAlgorithm, LamportClock, Node, NodeMeta, WriteOptions,
};
use fidias_proto::{Request, Response};
use fidias_ring::Ring;
use fidias_store::MemLogStore;
use fidias_wal::Wal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Handler {
    device: Arc<BlockDevice>,
    fs: Arc<FileSystem>,
    wal: Arc<Wal>,
}

#[async_trait]
impl RpcHandler for Handler {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SetBlock { .. }
            | Request::GetBlock { .. }
            | Request::RemoveBlock { .. }
            | Request::PublishBlock { .. } => self.device.handle(request).into(),
            Request::GetFile { .. } => self.fs.handle(request).into(),
            other => self.wal.handle_log(other).await.into(),
        }
    }
}

struct Cluster {
    net: Arc<LocalNetwork>,
    addrs: Vec<String>,
    devices: Vec<Arc<BlockDevice>>,
    fs: Vec<Arc<FileSystem>>,
    _handlers: Vec<Arc<dyn RpcHandler>>,
    cancel: CancellationToken,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn cluster(n: usize) -> Cluster {
    let hasher = HashAlgorithm::Sha256.shared();
    let net = LocalNetwork::new();
    let cancel = CancellationToken::new();
    let blocks = BlockConfig {
        block_size: 4,
        fan_out: 4,
        replicas: 3,
    };
    let nodes: Vec<Node> = (1..=n)
        .map(|i| {
            let addr = format!("b{i}:7200");
            Node::new(hasher.as_ref(), format!("b{i}"), addr.clone(), NodeMeta::single(&addr))
        })
        .collect();
    let mut devices = Vec::new();
    let mut fs = Vec::new();
    let mut handlers = Vec::new();
    for local in &nodes {
        let ring = Arc::new(Ring::new(RingConfig::default(), hasher.clone(), local.clone(), None));
        for node in &nodes {
            ring.join(node.clone());
        }
        let fsm = Arc::new(FsFsm::new("fs/"));
        let transport: SharedTransport = Arc::new(net.transport(&local.address));
        let client = RpcClient::new(
            Arc::clone(&transport),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let wal = Arc::new(Wal::new(
            WalConfig::default(),
            Arc::clone(&ring),
            Arc::new(MemLogStore::new(hasher.clone())),
            transport,
            fsm.clone(),
            Arc::new(LamportClock::new()),
        ));
        wal.start(&cancel);
        let device = Arc::new(BlockDevice::new(
            ring,
            Arc::new(MemBlockStore::new()),
            client,
            blocks.replicas,
        ));
        let files = Arc::new(FileSystem::new(
            Arc::clone(&wal),
            fsm,
            Arc::clone(&device),
            blocks.clone(),
            WriteOptions::default(),
        ));
        let handler: Arc<dyn RpcHandler> = Arc::new(Handler {
            device: Arc::clone(&device),
            fs: Arc::clone(&files),
            wal,
        });
        net.register(&local.address, &handler);
        devices.push(device);
        fs.push(files);
        handlers.push(handler);
    }
    Cluster {
        net,
        addrs: nodes.into_iter().map(|n| n.address).collect(),
        devices,
        fs,
        _handlers: handlers,
        cancel,
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn put_file(fs: &FileSystem, name: &str, data: &[u8]) -> Result<(), Error> {
    let mut writer = fs.create(name).await?;
    fs.write(&mut writer, &mut &data[..]).await?;
    fs.close(writer).await.map(|_| ())
}

async fn edit_file(fs: &FileSystem, name: &str, data: &[u8]) {
    let mut writer = fs.open_for_edit(name).await.unwrap();
    fs.write(&mut writer, &mut &data[..]).await.unwrap();
    fs.close(writer).await.unwrap();
}

#[tokio::test]
async fn test_block_lands_on_every_replica() {
    let c = cluster(3);
    let block = Block::new(BlockKind::Data, b"replicated".to_vec());
    let id = c.devices[0].set_block(&block).await.unwrap();
    for dev in &c.devices {
        assert!(dev.store().contains(&id).unwrap());
    }
    // served remotely after the local copy is gone
    c.devices[1].store().remove(&id).unwrap();
    assert_eq!(c.devices[1].get_block(&id).await.unwrap(), block);
}

#[tokio::test]
async fn test_block_write_needs_a_majority() {
    let c = cluster(3);
    c.net.partition(&c.addrs[2]);
    let id = c.devices[0]
        .set_block(&Block::new(BlockKind::Data, b"two of three".to_vec()))
        .await
        .unwrap();
    assert!(!c.devices[2].store().contains(&id).unwrap());

    c.net.partition(&c.addrs[1]);
    let err = c.devices[0]
        .set_block(&Block::new(BlockKind::Data, b"one of three".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientPeers { have: 1, need: 2 }));
}

#[tokio::test]
async fn test_remove_block_everywhere() {
    let c = cluster(3);
    let id = c.devices[0]
        .set_block(&Block::new(BlockKind::Data, b"short lived".to_vec()))
        .await
        .unwrap();
    assert_eq!(c.devices[1].remove_block(&id).await.unwrap(), 3);
    for dev in &c.devices {
        assert!(!dev.store().contains(&id).unwrap());
    }
    assert!(c.devices[0].get_block(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_file_roundtrip_from_any_node() {
    let c = cluster(3);
    let data = b"the quick brown fox jumps over the lazy dog".to_vec();
    put_file(&c.fs[0], "docs/fox.txt", &data).await.unwrap();

    for fs in &c.fs {
        assert!(eventually(|| fs.fsm().get("docs/fox.txt").is_some()).await);
        let reader = fs.open("/docs/fox.txt").await.unwrap();
        assert_eq!(reader.size, data.len() as u64);
        assert_eq!(reader.blocks, 11);
        assert_eq!(fs.read_all(&reader).await.unwrap(), data);
    }

    let stat = c.fs[2].stat("docs/fox.txt").await.unwrap();
    assert_eq!(stat.height, 1);
    assert_eq!(stat.size, data.len() as u64);
    assert_eq!(stat.versions.len(), 1);
}

#[tokio::test]
async fn test_create_refuses_existing_file() {
    let c = cluster(3);
    put_file(&c.fs[0], "once", b"first").await.unwrap();
    assert!(matches!(c.fs[1].create("once").await, Err(Error::Exists(_))));

    // a create that loses the race is refused at close
    let mut late = c.fs[1].create("raced").await.unwrap();
    put_file(&c.fs[0], "raced", b"winner").await.unwrap();
    c.fs[1].write(&mut late, &mut &b"loser"[..]).await.unwrap();
    assert!(matches!(c.fs[1].close(late).await, Err(Error::Exists(_))));
}

#[tokio::test]
async fn test_edit_and_pinned_versions() {
    let c = cluster(3);
    put_file(&c.fs[0], "report", b"draft one").await.unwrap();
    let pinned = c.fs[0].pin("report", "v1").await.unwrap();
    assert_eq!(pinned.height, 2);
    edit_file(&c.fs[0], "report", b"final version").await;

    let fs = &c.fs[0];
    let stat = fs.stat("report").await.unwrap();
    assert_eq!(stat.height, 3);
    assert_eq!(stat.versions.len(), 2);
    assert!(eventually(|| fs.fsm().get("report").map(|r| r.height) == Some(3)).await);

    let active = fs.open("report").await.unwrap();
    assert_eq!(fs.read_all(&active).await.unwrap(), b"final version");
    let v1 = fs.open_version("report", "v1").await.unwrap();
    assert_eq!(fs.read_all(&v1).await.unwrap(), b"draft one");
    assert!(fs.open_version("report", "v9").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_stale_edit_is_rejected() {
    let c = cluster(3);
    put_file(&c.fs[0], "shared", b"base").await.unwrap();
    let mut a = c.fs[0].open_for_edit("shared").await.unwrap();
    let mut b = c.fs[1].open_for_edit("shared").await.unwrap();
    c.fs[0].write(&mut a, &mut &b"from a"[..]).await.unwrap();
    c.fs[1].write(&mut b, &mut &b"from b"[..]).await.unwrap();
    c.fs[0].close(a).await.unwrap();
    assert!(eventually(|| c.fs[0].fsm().get("shared").map(|r| r.height) == Some(2)).await);
    assert!(matches!(
        c.fs[1].close(b).await,
        Err(Error::PreviousHashMismatch(_))
    ));

    let reader = c.fs[0].open("shared").await.unwrap();
    assert_eq!(c.fs[0].read_all(&reader).await.unwrap(), b"from a");
}

#[tokio::test]
async fn test_remove_then_recreate() {
    let c = cluster(3);
    put_file(&c.fs[0], "tmp/scratch", b"v1").await.unwrap();
    c.fs[1].remove("tmp/scratch").await.unwrap();
    for fs in &c.fs {
        assert!(eventually(|| fs.fsm().get("tmp/scratch").is_none()).await);
        assert!(fs.open("tmp/scratch").await.unwrap_err().is_not_found());
    }
    assert!(c.fs[0].remove("tmp/scratch").await.unwrap_err().is_not_found());

    put_file(&c.fs[2], "tmp/scratch", b"v2").await.unwrap();
    let stat = c.fs[2].stat("tmp/scratch").await.unwrap();
    assert_eq!(stat.height, 3);
}

#[tokio::test]
async fn test_close_without_content_is_refused() {
    let c = cluster(1);
    let writer = c.fs[0].create("empty-handle").await.unwrap();
    assert!(matches!(
        c.fs[0].close(writer).await,
        Err(Error::InvalidArgument(_))
    ));
}
