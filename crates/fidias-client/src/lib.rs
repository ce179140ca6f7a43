//! Fidias Client - Internal RPC
//!
//! This crate carries every peer-to-peer call:
//! - [`Transport`] / [`RpcHandler`] seams
//! - Pooled TCP transport and the matching accept loop
//! - In-process network for single-process clusters
//! - [`RpcClient`] with one typed method per request

pub mod client;
pub mod local;
pub mod pool;
pub mod tcp;
pub mod transport;

pub use client::RpcClient;
pub use local::{LocalNetwork, LocalTransport};
pub use pool::ConnPool;
pub use tcp::{TcpTransport, serve};
pub use transport::{RpcHandler, SharedTransport, Transport};
