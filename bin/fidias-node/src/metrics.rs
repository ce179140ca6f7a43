//! Per-method RPC counters kept by the dispatcher
//!
//! # Exported series
//! - `fidias_rpc_requests_total{method}` - requests received
//! - `fidias_rpc_success_total{method}` - requests answered without error
//! - `fidias_rpc_errors_total{method}` - requests answered with an error
//! - `fidias_rpc_latency_seconds_sum{method}` - summed handling time

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct MethodCounters {
    requests: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    latency_us: AtomicU64,
}

/// Counters for one method
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub method: &'static str,
    pub requests: u64,
    pub success: u64,
    pub errors: u64,
    pub latency_us: u64,
}

impl MethodStats {
    /// Mean handling time
    #[must_use]
    pub fn mean_latency(&self) -> Duration {
        if self.requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_us / self.requests)
    }
}

#[derive(Default)]
pub struct RpcMetrics {
    methods: DashMap<&'static str, MethodCounters>,
}

impl RpcMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one handled request
    pub fn record(&self, method: &'static str, ok: bool, elapsed: Duration) {
        let counters = self.methods.entry(method).or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        counters.latency_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Counters for `method`, zeroed when it was never called
    #[must_use]
    pub fn get(&self, method: &'static str) -> MethodStats {
        self.methods
            .get(method)
            .map(|c| snapshot(method, &c))
            .unwrap_or(MethodStats {
                method,
                ..MethodStats::default()
            })
    }

    /// All methods seen so far, sorted by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<MethodStats> {
        let mut out: Vec<MethodStats> = self
            .methods
            .iter()
            .map(|e| snapshot(e.key(), e.value()))
            .collect();
        out.sort_by_key(|s| s.method);
        out
    }

    /// Prometheus text exposition
    #[must_use]
    pub fn render(&self) -> String {
        let stats = self.snapshot();
        let mut out = String::new();
        let series: [(&str, &str, fn(&MethodStats) -> String); 4] = [
            ("fidias_rpc_requests_total", "counter", |s| s.requests.to_string()),
            ("fidias_rpc_success_total", "counter", |s| s.success.to_string()),
            ("fidias_rpc_errors_total", "counter", |s| s.errors.to_string()),
            ("fidias_rpc_latency_seconds_sum", "counter", |s| {
                format!("{:.6}", Duration::from_micros(s.latency_us).as_secs_f64())
            }),
        ];
        for (name, kind, value) in series {
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for s in &stats {
                let _ = writeln!(out, "{name}{{method=\"{}\"}} {}", s.method, value(s));
            }
        }
        out
    }
}

fn snapshot(method: &'static str, c: &MethodCounters) -> MethodStats {
    MethodStats {
        method,
        requests: c.requests.load(Ordering::Relaxed),
        success: c.success.load(Ordering::Relaxed),
        errors: c.errors.load(Ordering::Relaxed),
        latency_us: c.latency_us.load(Ordering::Relaxed),
    }
}
