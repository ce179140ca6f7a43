//! Membership upkeep: seed join, ping loop and failure detection

use dashmap::DashMap;
use fidias_client::RpcClient;
use fidias_common::{Error, LamportClock, Node, Result};
use fidias_ring::{MembershipEvent, Ring};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Pinger {
    ring: Arc<Ring>,
    client: RpcClient,
    clock: Arc<LamportClock>,
    failures: DashMap<String, u32>,
}

impl Pinger {
    #[must_use]
    pub fn new(ring: Arc<Ring>, client: RpcClient, clock: Arc<LamportClock>) -> Self {
        Self {
            ring,
            client,
            clock,
            failures: DashMap::new(),
        }
    }

    /// Join through the first seed that answers; returns the members learned
    pub async fn join_seeds(&self, seeds: &[String]) -> Result<usize> {
        let local = self.ring.local().clone();
        let mut last_err = None;
        for seed in seeds.iter().filter(|s| !self.ring.is_local(s)) {
            match self.client.join(seed, local.clone()).await {
                Ok(members) => {
                    let mut learned = self.admit(members.clone());
                    // announce ourselves to the rest of the cluster
                    for member in members.iter().filter(|m| {
                        m.address != *seed && !self.ring.is_local(&m.address)
                    }) {
                        match self.client.join(&member.address, local.clone()).await {
                            Ok(more) => learned += self.admit(more),
                            Err(e) => debug!("Announcing to {} failed: {}", member.address, e),
                        }
                    }
                    info!("Joined through {} ({} new members)", seed, learned);
                    return Ok(learned);
                }
                Err(e) => {
                    warn!("Join through {} failed: {}", seed, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// Add every unknown member; returns how many were new
    pub fn admit(&self, members: Vec<Node>) -> usize {
        members
            .into_iter()
            .filter(|n| !self.ring.is_local(&n.address))
            .map(|n| usize::from(self.ring.join(n)))
            .sum()
    }

    /// Ping every other member once; returns the hosts dropped this round
    pub async fn round(&self) -> Vec<String> {
        let hosts: Vec<String> = self
            .ring
            .snapshot()
            .nodes()
            .map(|n| n.address.clone())
            .filter(|h| !self.ring.is_local(h))
            .collect();
        let results = futures::future::join_all(hosts.iter().map(|h| self.ping(h))).await;

        let mut dropped = Vec::new();
        let limit = self.ring.config().ping_failure_limit.max(1);
        for (host, result) in hosts.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.failures.remove(&host);
                }
                Err(e) => {
                    let failed = {
                        let mut count = self.failures.entry(host.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    debug!("Ping to {} failed ({}/{}): {}", host, failed, limit, e);
                    if failed >= limit {
                        warn!("{} missed {} pings, removing it", host, failed);
                        self.failures.remove(&host);
                        let leave = MembershipEvent::Leave {
                            address: host.clone(),
                        };
                        if let Err(e) = self.ring.apply(&leave) {
                            warn!("Removing {} failed: {}", host, e);
                        }
                        dropped.push(host);
                    }
                }
            }
        }
        dropped
    }

    async fn ping(&self, host: &str) -> Result<()> {
        let start = Instant::now();
        let local = &self.ring.local().address;
        let (ltime, coordinate) = self
            .client
            .ping(host, local, self.clock.increment(), self.ring.coordinate())
            .await?;
        self.clock.witness(ltime);
        let event = MembershipEvent::Ping {
            address: host.to_string(),
            ltime,
            coordinate: Some(coordinate),
            rtt_secs: start.elapsed().as_secs_f64(),
        };
        self.ring.apply(&event)
    }

    /// Consecutive failures recorded for `host`
    #[must_use]
    pub fn failures(&self, host: &str) -> u32 {
        self.failures.get(host).map_or(0, |c| *c)
    }

    /// Run [`Self::round`] every `ping_interval_ms` until cancelled
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pinger = Arc::clone(self);
        let period = Duration::from_millis(self.ring.config().ping_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pinger.round().await;
                    }
                }
            }
            debug!("Ping loop stopped");
        })
    }
}

/// Reject a joiner whose id was not derived from its address with this
/// cluster's hasher
pub fn check_joiner(ring: &Ring, node: &Node) -> Result<()> {
    if node.id != ring.hasher().hash(node.address.as_bytes()) {
        return Err(Error::invalid_argument(format!(
            "{} joined with an id not derived from its address",
            node.address
        )));
    }
    Ok(())
}
