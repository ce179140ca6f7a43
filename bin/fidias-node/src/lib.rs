//! Fidias node - one member of a Fidias cluster
//!
//! - `FidiasNode`: builds and owns every subsystem, delegates ring events
//! - `dispatch`: the node's `RpcHandler`, with per-method metrics
//! - `Pinger`: seed join, ping loop and failure detection

mod dispatch;
pub mod membership;
pub mod metrics;
pub mod node;

pub use membership::Pinger;
pub use metrics::{MethodStats, RpcMetrics};
pub use node::FidiasNode;
