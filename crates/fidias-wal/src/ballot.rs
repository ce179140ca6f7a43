//! Ballot bookkeeping
//!
//! A ballot moves `Open -> Voting -> Committed | Failed`. Votes and commit
//! acknowledgements are collected while voting; the outcome is decided by
//! [`Ballot::conclude`]. Terminal states are latched.

use fidias_common::{Entry, Id};
use std::time::{Duration, Instant};

/// Ballot lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BallotState {
    Open,
    Voting,
    Committed,
    Failed,
}

impl BallotState {
    /// Whether the state is latched
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

/// Votes for one proposed entry
#[derive(Debug)]
pub struct Ballot {
    pub entry: Entry,
    pub id: Id,
    state: BallotState,
    votes: Vec<String>,
    commits: Vec<String>,
    started: Instant,
}

impl Ballot {
    #[must_use]
    pub fn new(entry: Entry, id: Id) -> Self {
        Self {
            entry,
            id,
            state: BallotState::Open,
            votes: Vec::new(),
            commits: Vec::new(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> BallotState {
        self.state
    }

    /// Start collecting votes
    pub fn open_voting(&mut self) -> bool {
        if self.state == BallotState::Open {
            self.state = BallotState::Voting;
            true
        } else {
            false
        }
    }

    /// Record a vote from `host`; duplicates count once
    pub fn vote(&mut self, host: &str) {
        if self.state == BallotState::Voting && !self.votes.iter().any(|h| h == host) {
            self.votes.push(host.to_string());
        }
    }

    /// Record a commit acknowledgement from `host`
    pub fn ack(&mut self, host: &str) {
        if self.state == BallotState::Voting && !self.commits.iter().any(|h| h == host) {
            self.commits.push(host.to_string());
        }
    }

    /// Whether enough votes were collected to broadcast the commit
    #[must_use]
    pub fn has_quorum(&self, min_votes: usize) -> bool {
        self.state == BallotState::Voting && self.votes.len() >= min_votes
    }

    /// Decide the outcome from the commit acknowledgements
    pub fn conclude(&mut self, min_votes: usize) -> BallotState {
        if self.state == BallotState::Voting {
            self.state = if self.commits.len() >= min_votes {
                BallotState::Committed
            } else {
                BallotState::Failed
            };
        }
        self.state
    }

    /// Latch `Failed` unless already terminal
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = BallotState::Failed;
        }
    }

    #[must_use]
    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.commits.len()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
