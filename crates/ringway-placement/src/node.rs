//! Ring participants.

use serde::{Deserialize, Serialize};

/// Identifier of a node, assigned by the [`Builder`](crate::Builder).
pub type NodeId = u64;

/// An addressable participant in the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) active: bool,
    pub(crate) capacity: u32,
    /// Most general group first, e.g. `["zone-a", "rack-3"]`.
    pub(crate) tiers: Vec<String>,
    /// Index 0 is the primary address.
    pub(crate) addresses: Vec<String>,
    pub(crate) meta: String,
    pub(crate) conf: Vec<u8>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Relative weight; a node's partition share tracks `capacity / total`.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn tiers(&self) -> &[String] {
        &self.tiers
    }

    /// Tier at `level`, where level 0 is the most general group.
    pub fn tier(&self, level: usize) -> Option<&str> {
        self.tiers.get(level).map(String::as_str)
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Address at `index`; index 0 is the primary address.
    pub fn address(&self, index: usize) -> Option<&str> {
        self.addresses.get(index).map(String::as_str)
    }

    pub fn meta(&self) -> &str {
        &self.meta
    }

    pub fn conf(&self) -> &[u8] {
        &self.conf
    }

    /// Whether the node may own partitions.
    pub(crate) fn assignable(&self) -> bool {
        self.active && self.capacity > 0
    }
}
