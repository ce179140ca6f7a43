//! Fidias WAL - ballot-based replicated log
//!
//! This crate turns per-key entry logs into a replicated log:
//! - Ballots led by the first participant of a key's replica set
//! - Exactly-once FSM apply per replica, in height order per key
//! - Heal channel feeding the per-key reconciliation primitive
//! - Read paths that scour replica successors

pub mod apply;
pub mod ballot;
pub mod fsm;
pub mod heal;
mod service;
pub mod wal;

pub use apply::Applier;
pub use ballot::{Ballot, BallotState};
pub use fsm::{Fsm, FsmMux};
pub use heal::{HealRequest, Reconciled};
pub use wal::{Proposed, Wal};

#[cfg(test)]
mod tests;
