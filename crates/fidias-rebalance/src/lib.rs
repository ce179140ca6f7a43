//! Fidias Rebalance - keeping replicas where the ring says they belong
//!
//! - Relocator: streams moved keys to a new predecessor on churn
//! - Fetcher: pulls announced keylogs, then reconciles each fetched key
//! - Rebalancer: periodic sweep that queues local keys for reconciliation

pub mod fetcher;
pub mod rebalancer;
pub mod relocator;

pub use fetcher::{FetchRequest, Fetcher};
pub use rebalancer::Rebalancer;
pub use relocator::{RelocateJob, Relocator};
