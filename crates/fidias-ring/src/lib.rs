//! Fidias Ring - DHT placement and membership
//!
//! This crate maps keys and block ids to ordered replica sets:
//! - Vnode ring with deterministic replica derivation
//! - Affinity groups ordered by bucket and network coordinate
//! - Membership events in, ring events (new predecessor, join, leave) out
//! - Owned key ranges with change tracking for stability checks
//! - Block locator hints

pub mod coords;
pub mod events;
pub mod keyblocks;
pub mod locator;
pub mod ring;

pub use coords::VivaldiClient;
pub use events::{MembershipEvent, RingEvent};
pub use keyblocks::{KeyBlocks, KeyRange};
pub use locator::BlockLocator;
pub use ring::{Membership, Ring, Scour};
