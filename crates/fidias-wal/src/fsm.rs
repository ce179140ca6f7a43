//! State machines fed by the log
//!
//! Every committed entry is handed to the [`Fsm`] registered for its
//! opcode. Applies for one key arrive in height order.

use fidias_common::{Entry, Error, Id, Opcode, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Consumer of committed entries
pub trait Fsm: Send + Sync {
    /// Apply `entry` (whose id is `id`) to local state
    fn apply(&self, entry: &Entry, id: &Id) -> Result<()>;
}

/// Routes entries to state machines by opcode
#[derive(Default)]
pub struct FsmMux {
    routes: HashMap<Opcode, Arc<dyn Fsm>>,
}

impl FsmMux {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `ops` to `fsm`
    #[must_use]
    pub fn route(mut self, ops: &[Opcode], fsm: Arc<dyn Fsm>) -> Self {
        for op in ops {
            self.routes.insert(*op, Arc::clone(&fsm));
        }
        self
    }
}

impl Fsm for FsmMux {
    fn apply(&self, entry: &Entry, id: &Id) -> Result<()> {
        let op = entry
            .opcode()
            .ok_or_else(|| Error::InvalidEntry(format!("unknown opcode in {}", id.short())))?;
        match self.routes.get(&op) {
            Some(fsm) => fsm.apply(entry, id),
            None => Err(Error::InvalidEntry(format!("no state machine for {op:?}"))),
        }
    }
}
