//! Immutable ring snapshots.

use serde::{Deserialize, Serialize};

use crate::builder::MAX_PARTITION_BITS;
use crate::error::RingError;
use crate::node::{Node, NodeId};

/// Owners gained and lost by one partition between two ring snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// The partition whose owner set changed.
    pub partition: u32,
    /// Owners in the old ring that are not owners in the new one.
    pub from: Vec<NodeId>,
    /// Owners in the new ring that were not owners in the old one.
    pub to: Vec<NodeId>,
}

/// A versioned partition -> replica owners mapping.
///
/// A `Ring` never changes after construction; new snapshots come from
/// [`Builder::ring`](crate::Builder::ring). Share it behind an `Arc` for
/// concurrent readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    pub(crate) version: u64,
    pub(crate) replica_count: usize,
    pub(crate) partition_bits: u16,
    /// All nodes known to the builder, sorted by ID.
    pub(crate) nodes: Vec<Node>,
    /// Partition -> ordered owners, each of length `replica_count`.
    pub(crate) assignment: Vec<Vec<NodeId>>,
    pub(crate) local_node_id: Option<NodeId>,
}

impl Ring {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn partition_bits(&self) -> u16 {
        self.partition_bits
    }

    pub fn partition_count(&self) -> u32 {
        1 << self.partition_bits
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.local_node_id
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.local_node_id.and_then(|id| self.node(id))
    }

    /// Return this snapshot bound to `id` as the local node.
    pub fn with_local_node(mut self, id: NodeId) -> Result<Ring, RingError> {
        if self.node(id).is_none() {
            return Err(RingError::UnknownNode(id));
        }
        self.local_node_id = Some(id);
        Ok(self)
    }

    /// Check the invariants every lookup relies on.
    pub(crate) fn validate(&self) -> Result<(), RingError> {
        let corrupt = |msg: String| Err(RingError::Corrupt(msg));
        if self.replica_count < 1 {
            return corrupt(format!("replica count {}", self.replica_count));
        }
        if !(1..=MAX_PARTITION_BITS).contains(&self.partition_bits) {
            return corrupt(format!("partition bits {}", self.partition_bits));
        }
        if let Some(pair) = self.nodes.windows(2).find(|w| w[0].id >= w[1].id) {
            return corrupt(format!("node {} listed after node {}", pair[1].id, pair[0].id));
        }
        let count = self.partition_count() as usize;
        if self.assignment.len() != count {
            return corrupt(format!(
                "{} assignment rows for {count} partitions",
                self.assignment.len()
            ));
        }
        for (partition, owners) in self.assignment.iter().enumerate() {
            if owners.len() != self.replica_count {
                return corrupt(format!(
                    "partition {partition} has {} owners, expected {}",
                    owners.len(),
                    self.replica_count
                ));
            }
            if let Some(id) = owners.iter().find(|id| self.node(**id).is_none()) {
                return corrupt(format!("partition {partition} owned by unknown node {id}"));
            }
        }
        if let Some(id) = self.local_node_id
            && self.node(id).is_none()
        {
            return corrupt(format!("local node {id} is not in the ring"));
        }
        Ok(())
    }

    /// Partition for a 64-bit key hash: its top `partition_bits` bits.
    pub fn partition_for_hash(&self, hash: u64) -> u32 {
        (hash >> (64 - u32::from(self.partition_bits))) as u32
    }

    /// Owner IDs of `partition`, primary first. Empty if out of range.
    pub fn responsible_ids(&self, partition: u32) -> &[NodeId] {
        self.assignment
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Owners of `partition`, primary first. Empty if out of range.
    pub fn responsible_nodes(&self, partition: u32) -> Vec<&Node> {
        self.responsible_ids(partition)
            .iter()
            .filter_map(|id| self.node(*id))
            .collect()
    }

    /// Whether the local node is one of the owners of `partition`.
    pub fn responsible(&self, partition: u32) -> bool {
        self.local_node_id
            .is_some_and(|id| self.responsible_ids(partition).contains(&id))
    }

    /// Partitions the local node owns, in ascending order.
    pub fn local_partitions(&self) -> Vec<u32> {
        (0..self.partition_count())
            .filter(|p| self.responsible(*p))
            .collect()
    }

    /// Compute how ownership changed between two snapshots.
    ///
    /// Both rings must have the same partition count; partitions beyond the
    /// shorter ring are ignored.
    pub fn diff(old: &Ring, new: &Ring) -> Vec<Migration> {
        old.assignment
            .iter()
            .zip(&new.assignment)
            .enumerate()
            .filter_map(|(partition, (before, after))| {
                let from: Vec<NodeId> = before
                    .iter()
                    .filter(|id| !after.contains(id))
                    .copied()
                    .collect();
                let to: Vec<NodeId> = after
                    .iter()
                    .filter(|id| !before.contains(id))
                    .copied()
                    .collect();
                (!from.is_empty() || !to.is_empty()).then_some(Migration {
                    partition: partition as u32,
                    from,
                    to,
                })
            })
            .collect()
    }

    /// Number of partitions whose owner set differs from `other`.
    pub fn moved_partitions(&self, other: &Ring) -> usize {
        Ring::diff(self, other).len()
    }
}
