//! Node orchestrator
//!
//! Owns every subsystem of one Fidias node and wires them together:
//!
//! ```text
//!   RPC ──► dispatch ──┬─► KvService ──┐
//!                      ├─► FileSystem ─┼─► Wal ──► LogStore
//!                      ├─► BlockDevice │    └──► FsmMux ─► KvFsm / FsFsm
//!                      ├─► Fetcher ────┘
//!                      └─► Ring ◄── Pinger
//!
//!   Ring events ──► delegate ──► Relocator / stable store
//! ```

use crate::membership::Pinger;
use crate::metrics::RpcMetrics;
use fidias_blocks::{
    BlockDevice, FileBlockStore, FileSystem, FsFsm, MemBlockStore, SharedBlockStore,
};
use fidias_client::{RpcClient, SharedTransport};
use fidias_common::config::StorageBackend;
use fidias_common::{Config, LamportClock, Node, NodeMeta, Opcode, Result, SharedHasher};
use fidias_kv::{KvFsm, KvService};
use fidias_rebalance::{Fetcher, Rebalancer, RelocateJob, Relocator};
use fidias_ring::{Ring, RingEvent};
use fidias_store::{DiskLogStore, MemLogStore, SharedLogStore, StableState, StableStore};
use fidias_wal::{FsmMux, Wal};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FidiasNode {
    pub(crate) config: Arc<Config>,
    pub(crate) ring: Arc<Ring>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) kv: Arc<KvService>,
    pub(crate) fs: Arc<FileSystem>,
    pub(crate) device: Arc<BlockDevice>,
    pub(crate) fetcher: Arc<Fetcher>,
    pub(crate) relocator: Arc<Relocator>,
    pub(crate) rebalancer: Arc<Rebalancer>,
    pub(crate) pinger: Arc<Pinger>,
    pub(crate) metrics: RpcMetrics,
    transport: SharedTransport,
    stable: Option<StableStore>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RingEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FidiasNode {
    /// Build a node from validated configuration. Nothing runs until
    /// [`Self::start`].
    pub fn new(config: Config, transport: SharedTransport) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let hasher = config.ring.hash.shared();

        let address = config.advertise_address().to_string();
        let meta = NodeMeta {
            region: config.node.region.clone(),
            sector: config.node.sector.clone(),
            zone: config.node.zone.clone(),
            ..NodeMeta::single(&address)
        };
        let local = Node::new(hasher.as_ref(), config.node.name.clone(), address, meta);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ring = Arc::new(Ring::new(
            config.ring.clone(),
            Arc::clone(&hasher),
            local,
            Some(events_tx),
        ));

        let (log_store, block_store, stable) = open_stores(&config, &hasher)?;

        let kv_fsm = Arc::new(KvFsm::new(config.namespaces.kv.clone()));
        let fs_fsm = Arc::new(FsFsm::new(config.namespaces.fs.clone()));
        let mux = FsmMux::new()
            .route(&[Opcode::KvSet, Opcode::KvDel], kv_fsm.clone())
            .route(&[Opcode::FsSet, Opcode::FsDel], fs_fsm.clone());
        let clock = Arc::new(LamportClock::new());
        let wal = Arc::new(Wal::new(
            config.wal.clone(),
            Arc::clone(&ring),
            log_store,
            Arc::clone(&transport),
            Arc::new(mux),
            Arc::clone(&clock),
        ));

        let fetcher = Arc::new(Fetcher::new(Arc::clone(&wal), config.wal.fetch_queue));
        let relocator = Arc::new(Relocator::new(Arc::clone(&wal), config.ring.rebalance_buffer));
        let rebalancer = Arc::new(Rebalancer::new(Arc::clone(&wal), Arc::clone(&fetcher)));
        let kv = Arc::new(KvService::new(Arc::clone(&wal), kv_fsm));
        let device = Arc::new(BlockDevice::new(
            Arc::clone(&ring),
            block_store,
            wal.client().clone(),
            config.blocks.replicas,
        ));
        let fs = Arc::new(FileSystem::new(
            Arc::clone(&wal),
            fs_fsm,
            Arc::clone(&device),
            config.blocks.clone(),
            config.write.clone(),
        ));
        let pinger = Arc::new(Pinger::new(
            Arc::clone(&ring),
            RpcClient::new(
                Arc::clone(&transport),
                config.wal.read_timeout(),
                config.wal.write_timeout(),
            ),
            clock,
        ));

        let node = Arc::new(Self {
            config,
            ring,
            wal,
            kv,
            fs,
            device,
            fetcher,
            relocator,
            rebalancer,
            pinger,
            metrics: RpcMetrics::new(),
            transport,
            stable,
            events: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        node.restore()?;
        Ok(node)
    }

    /// Rejoin the members saved by a previous run
    fn restore(&self) -> Result<()> {
        let Some(stable) = &self.stable else {
            return Ok(());
        };
        let Some(state) = stable.load()? else {
            return Ok(());
        };
        if state.hash != self.ring.hasher().name() {
            warn!(
                "Stable state was written with {}, running {}; ignoring saved members",
                state.hash,
                self.ring.hasher().name()
            );
            return Ok(());
        }
        let restored = self.pinger.admit(state.members);
        info!("Restored {} members from {}", restored, stable.path().display());
        Ok(())
    }

    /// Save the current membership when a stable store is configured
    pub fn persist(&self) {
        let Some(stable) = &self.stable else {
            return;
        };
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let state = StableState {
            node_name: self.config.node.name.clone(),
            hash: self.ring.hasher().name().to_string(),
            members: self.ring.snapshot().nodes().cloned().collect(),
            saved_at,
        };
        if let Err(e) = stable.save(&state) {
            warn!("Saving stable state failed: {}", e);
        }
    }

    /// Spawn every background role. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(events) = self.events.lock().take() else {
            return;
        };
        let cancel = &self.cancel;
        let mut tasks = self.wal.start(cancel);
        tasks.extend(self.fetcher.spawn(cancel));
        tasks.extend(self.relocator.spawn(cancel.clone()));
        tasks.push(self.rebalancer.spawn(cancel.clone()));
        tasks.push(self.pinger.spawn(cancel.clone()));
        tasks.push(self.spawn_delegate(events));
        self.tasks.lock().extend(tasks);
        info!(
            "Node {} started at {}",
            self.config.node.name,
            self.ring.local().address
        );
    }

    fn spawn_delegate(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RingEvent>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => node.on_ring_event(event).await,
                        None => break,
                    }
                }
            }
            debug!("Ring delegate stopped");
        })
    }

    async fn on_ring_event(&self, event: RingEvent) {
        if let Some(job) = RelocateJob::from_event(&event) {
            debug!(
                "New predecessor {} for local vnode {}",
                job.new_pred.host,
                job.local.id.short()
            );
            if let Err(e) = self.relocator.enqueue(job).await {
                warn!("Relocation not queued: {}", e);
            }
            return;
        }
        match &event {
            RingEvent::HostJoined { node } => debug!("Member {} joined", node.address),
            RingEvent::HostLeft { address } => debug!("Member {} left", address),
            RingEvent::NewPredecessor { .. } => {}
        }
        self.persist();
    }

    /// Join the configured seeds
    pub async fn join_seeds(&self) -> Result<usize> {
        self.pinger.join_seeds(&self.config.node.seeds).await
    }

    /// Stop background roles, close connections and save membership
    pub async fn shutdown(&self) {
        info!("Node {} shutting down", self.config.node.name);
        self.cancel.cancel();
        self.transport.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.persist();
        for s in self.metrics.snapshot() {
            info!(
                "RPC {}: {} requests, {} errors, mean {:?}",
                s.method,
                s.requests,
                s.errors,
                s.mean_latency()
            );
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    #[must_use]
    pub const fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    #[must_use]
    pub const fn kv(&self) -> &Arc<KvService> {
        &self.kv
    }

    #[must_use]
    pub const fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    #[must_use]
    pub const fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    #[must_use]
    pub const fn pinger(&self) -> &Arc<Pinger> {
        &self.pinger
    }

    #[must_use]
    pub const fn metrics(&self) -> &RpcMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.ring.local().address
    }

    /// Token cancelled on shutdown
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn open_stores(
    config: &Config,
    hasher: &SharedHasher,
) -> Result<(SharedLogStore, SharedBlockStore, Option<StableStore>)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let log: SharedLogStore = Arc::new(MemLogStore::new(Arc::clone(hasher)));
            let blocks: SharedBlockStore = Arc::new(MemBlockStore::new());
            Ok((log, blocks, None))
        }
        StorageBackend::Disk => {
            let dir = &config.node.data_dir;
            let log: SharedLogStore = Arc::new(DiskLogStore::open(dir, Arc::clone(hasher))?);
            let blocks: SharedBlockStore = Arc::new(FileBlockStore::open(dir)?);
            info!("Stores opened under {}", dir.display());
            Ok((log, blocks, Some(StableStore::new(dir))))
        }
    }
}
