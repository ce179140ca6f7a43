//! Membership input and ring output events

use fidias_common::{Coordinate, Error, Node, NodeMeta, Result, Vnode};
use fidias_common::Hasher;

/// Event delivered by the membership layer
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipEvent {
    /// A member joined; `meta` is the marshaled [`NodeMeta`]
    Join { name: String, address: String, meta: Vec<u8> },
    /// A member left or was declared dead
    Leave { address: String },
    /// A member's metadata changed
    Update { name: String, address: String, meta: Vec<u8> },
    /// A ping round trip completed
    Ping {
        address: String,
        ltime: u64,
        coordinate: Option<Coordinate>,
        rtt_secs: f64,
    },
}

impl MembershipEvent {
    /// Join event for a node
    pub fn join(node: &Node) -> Result<Self> {
        Ok(Self::Join {
            name: node.name.clone(),
            address: node.address.clone(),
            meta: node.meta.marshal()?,
        })
    }

    /// Decode the node carried by a join or update event
    pub fn node(&self, hasher: &dyn Hasher) -> Result<Node> {
        match self {
            Self::Join { name, address, meta } | Self::Update { name, address, meta } => {
                let meta = if meta.is_empty() {
                    NodeMeta::single(address)
                } else {
                    NodeMeta::unmarshal(meta)?
                };
                Ok(Node::new(hasher, name.clone(), address.clone(), meta))
            }
            _ => Err(Error::invalid_argument("event carries no node")),
        }
    }
}

/// Event emitted by the ring to its delegate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RingEvent {
    /// A vnode arrived between `local` and its previous predecessor
    NewPredecessor {
        local: Vnode,
        new_pred: Vnode,
        old_pred: Vnode,
    },
    /// A host was added to the ring
    HostJoined { node: Node },
    /// A host was removed from the ring
    HostLeft { address: String },
}
