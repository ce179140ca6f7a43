//! Block locator hints: `block-id -> hosts` known to hold a block

use dashmap::DashMap;
use fidias_common::Id;

const MAX_HINTS: usize = 8;

/// Hints published on successful local block writes
#[derive(Debug, Default)]
pub struct BlockLocator {
    hints: DashMap<Id, Vec<String>>,
}

impl BlockLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `host` holds `id`
    pub fn publish(&self, id: Id, host: &str) {
        let mut hosts = self.hints.entry(id).or_default();
        if !hosts.iter().any(|h| h == host) {
            if hosts.len() == MAX_HINTS {
                hosts.remove(0);
            }
            hosts.push(host.to_string());
        }
    }

    /// Hosts hinted for `id`, most recent last
    #[must_use]
    pub fn hints(&self, id: &Id) -> Vec<String> {
        self.hints.get(id).map(|h| h.clone()).unwrap_or_default()
    }

    /// Drop every hint for `id`
    pub fn remove(&self, id: &Id) {
        self.hints.remove(id);
    }

    /// Drop a departed host from every hint
    pub fn forget_host(&self, host: &str) {
        self.hints.retain(|_, hosts| {
            hosts.retain(|h| h != host);
            !hosts.is_empty()
        });
    }
}
