//! Fidias KV - consistent key-value store over the replicated log
//!
//! - `KvFsm`: applies KV entries of one namespace, inferring directories
//! - `KvService`: Get/Set/List/Remove and their compare-and-set forms

pub mod fsm;
pub mod service;

pub use fsm::KvFsm;
pub use service::KvService;
