//! Mutable ring builder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RingError;
use crate::node::{Node, NodeId};
use crate::placement;
use crate::ring::Ring;

/// Default partition bits (256 partitions).
pub const DEFAULT_PARTITION_BITS: u16 = 8;

/// Largest supported partition bits.
pub const MAX_PARTITION_BITS: u16 = 24;

/// Accumulates nodes and produces [`Ring`] snapshots.
///
/// The builder remembers the last assignment it produced so that the next
/// [`ring`](Builder::ring) call only moves the partitions it has to. It is a
/// single-writer structure: wrap it in a lock if several tasks mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    version: u64,
    replica_count: usize,
    partition_bits: u16,
    allow_duplicate_addresses: bool,
    next_node_id: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    last_assignment: Vec<Vec<NodeId>>,
    last_partition_bits: u16,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            version: 0,
            replica_count: 1,
            partition_bits: DEFAULT_PARTITION_BITS,
            allow_duplicate_addresses: false,
            next_node_id: 1,
            nodes: BTreeMap::new(),
            last_assignment: Vec::new(),
            last_partition_bits: 0,
        }
    }

    /// Version of the most recently built ring (0 before the first build).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn set_replica_count(&mut self, count: usize) -> Result<(), RingError> {
        if count < 1 {
            return Err(RingError::InvalidReplicaCount(count));
        }
        self.replica_count = count;
        Ok(())
    }

    pub fn partition_bits(&self) -> u16 {
        self.partition_bits
    }

    pub fn set_partition_bits(&mut self, bits: u16) -> Result<(), RingError> {
        if !(1..=MAX_PARTITION_BITS).contains(&bits) {
            return Err(RingError::InvalidPartitionBits(bits));
        }
        self.partition_bits = bits;
        Ok(())
    }

    /// Permit several nodes to share an address (off by default).
    pub fn allow_duplicate_addresses(&mut self, allow: bool) {
        self.allow_duplicate_addresses = allow;
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Add a node and return it with its newly assigned ID.
    pub fn add_node(
        &mut self,
        active: bool,
        capacity: u32,
        tiers: &[&str],
        addresses: &[&str],
        meta: &str,
        conf: &[u8],
    ) -> Result<Node, RingError> {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        self.check_addresses(None, &addresses)?;

        let id = self.next_node_id;
        self.next_node_id += 1;
        let node = Node {
            id,
            active,
            capacity,
            tiers: tiers.iter().map(|t| t.to_string()).collect(),
            addresses,
            meta: meta.to_string(),
            conf: conf.to_vec(),
        };
        debug!(node_id = id, capacity, active, "added node to builder");
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Remove a node. Its partitions are reassigned on the next build.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, RingError> {
        let node = self.nodes.remove(&id).ok_or(RingError::UnknownNode(id))?;
        debug!(node_id = id, "removed node from builder");
        Ok(node)
    }

    pub fn set_active(&mut self, id: NodeId, active: bool) -> Result<(), RingError> {
        self.node_mut(id)?.active = active;
        Ok(())
    }

    pub fn set_capacity(&mut self, id: NodeId, capacity: u32) -> Result<(), RingError> {
        self.node_mut(id)?.capacity = capacity;
        Ok(())
    }

    pub fn set_tiers(&mut self, id: NodeId, tiers: &[&str]) -> Result<(), RingError> {
        self.node_mut(id)?.tiers = tiers.iter().map(|t| t.to_string()).collect();
        Ok(())
    }

    pub fn set_addresses(&mut self, id: NodeId, addresses: &[&str]) -> Result<(), RingError> {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        self.check_addresses(Some(id), &addresses)?;
        self.node_mut(id)?.addresses = addresses;
        Ok(())
    }

    pub fn set_meta(&mut self, id: NodeId, meta: &str) -> Result<(), RingError> {
        self.node_mut(id)?.meta = meta.to_string();
        Ok(())
    }

    pub fn set_conf(&mut self, id: NodeId, conf: &[u8]) -> Result<(), RingError> {
        self.node_mut(id)?.conf = conf.to_vec();
        Ok(())
    }

    /// Compute a new ring snapshot.
    ///
    /// On failure nothing changes: the version stays put and the previous
    /// assignment is still the baseline for the next attempt.
    pub fn ring(&mut self) -> Result<Ring, RingError> {
        let partition_count = 1usize << self.partition_bits;
        let previous = self.projected_assignment();
        let nodes: Vec<Node> = self.nodes.values().cloned().collect();

        let placement =
            placement::place(&previous, &nodes, self.replica_count, partition_count)?;
        if placement.degraded > 0 {
            warn!(
                degraded = placement.degraded,
                partitions = partition_count,
                "not enough distinct tiers; some replicas share an innermost tier"
            );
        }

        let moved = previous
            .iter()
            .zip(&placement.assignment)
            .filter(|(before, after)| {
                before.len() != after.len() || before.iter().any(|id| !after.contains(id))
            })
            .count();

        self.version += 1;
        self.last_assignment = placement.assignment.clone();
        self.last_partition_bits = self.partition_bits;
        info!(
            version = self.version,
            nodes = nodes.len(),
            replicas = self.replica_count,
            partitions = partition_count,
            moved,
            "built ring"
        );

        Ok(Ring {
            version: self.version,
            replica_count: self.replica_count,
            partition_bits: self.partition_bits,
            nodes,
            assignment: placement.assignment,
            local_node_id: None,
        })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, RingError> {
        self.nodes.get_mut(&id).ok_or(RingError::UnknownNode(id))
    }

    fn check_addresses(&self, owner: Option<NodeId>, addresses: &[String]) -> Result<(), RingError> {
        if self.allow_duplicate_addresses {
            return Ok(());
        }
        for node in self.nodes.values().filter(|n| Some(n.id) != owner) {
            if let Some(address) = addresses.iter().find(|a| node.addresses.contains(a)) {
                return Err(RingError::DuplicateAddress {
                    address: address.clone(),
                    node_id: node.id,
                });
            }
        }
        Ok(())
    }

    /// Check the invariants `ring()` relies on.
    pub(crate) fn validate(&self) -> Result<(), RingError> {
        let corrupt = |msg: String| Err(RingError::Corrupt(msg));
        if self.replica_count < 1 {
            return corrupt(format!("replica count {}", self.replica_count));
        }
        if !(1..=MAX_PARTITION_BITS).contains(&self.partition_bits) {
            return corrupt(format!("partition bits {}", self.partition_bits));
        }
        if let Some((key, node)) = self.nodes.iter().find(|(key, node)| **key != node.id) {
            return corrupt(format!("node {} stored under id {key}", node.id));
        }
        if let Some(last) = self.nodes.keys().next_back()
            && *last >= self.next_node_id
        {
            return corrupt(format!("node {last} not below next id {}", self.next_node_id));
        }
        if !self.last_assignment.is_empty() {
            let bits = self.last_partition_bits;
            if !(1..=MAX_PARTITION_BITS).contains(&bits) {
                return corrupt(format!("last partition bits {bits}"));
            }
            if self.last_assignment.len() != 1 << bits {
                return corrupt(format!(
                    "{} last assignment rows for {bits} partition bits",
                    self.last_assignment.len()
                ));
            }
        }
        Ok(())
    }

    /// Last assignment mapped onto the current partition count.
    fn projected_assignment(&self) -> Vec<Vec<NodeId>> {
        if self.last_assignment.is_empty() {
            return Vec::new();
        }
        let old = self.last_partition_bits;
        let new = self.partition_bits;
        let count = 1usize << new;
        if new == old {
            self.last_assignment.clone()
        } else if new > old {
            let shift = new - old;
            (0..count)
                .map(|p| self.last_assignment[p >> shift].clone())
                .collect()
        } else {
            let shift = old - new;
            (0..count)
                .map(|p| self.last_assignment[p << shift].clone())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn builder_with(nodes: usize, replicas: usize) -> Builder {
        let mut b = Builder::new();
        b.set_replica_count(replicas).unwrap();
        for i in 0..nodes {
            let addr = format!("127.0.0.1:{}", 9000 + i);
            b.add_node(true, 1, &[], &[&addr], "", b"Conf").unwrap();
        }
        b
    }

    #[test]
    fn test_node_ids_are_sequential() {
        let mut b = Builder::new();
        let a = b.add_node(true, 1, &[], &["10.0.0.1:9999"], "a", b"").unwrap();
        let c = b.add_node(true, 1, &[], &["10.0.0.2:9999"], "b", b"").unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(c.id(), 2);

        b.remove_node(2).unwrap();
        let d = b.add_node(true, 1, &[], &["10.0.0.3:9999"], "c", b"").unwrap();
        assert_eq!(d.id(), 3, "removed IDs are not reused");
    }

    #[test]
    fn test_invalid_replica_count() {
        let mut b = Builder::new();
        assert!(matches!(
            b.set_replica_count(0),
            Err(RingError::InvalidReplicaCount(0))
        ));
        assert_eq!(b.replica_count(), 1);
    }

    #[test]
    fn test_invalid_partition_bits() {
        let mut b = Builder::new();
        assert!(b.set_partition_bits(0).is_err());
        assert!(b.set_partition_bits(MAX_PARTITION_BITS + 1).is_err());
        b.set_partition_bits(4).unwrap();
        assert_eq!(b.partition_bits(), 4);
    }

    #[test]
    fn test_duplicate_address_policy() {
        let mut b = Builder::new();
        b.add_node(true, 1, &[], &["127.0.0.1:9999"], "", b"").unwrap();
        let err = b
            .add_node(true, 1, &[], &["127.0.0.1:9999"], "", b"")
            .unwrap_err();
        assert!(matches!(err, RingError::DuplicateAddress { node_id: 1, .. }));

        b.allow_duplicate_addresses(true);
        b.add_node(true, 1, &[], &["127.0.0.1:9999"], "", b"").unwrap();
        assert_eq!(b.nodes().count(), 2);
    }

    #[test]
    fn test_set_addresses_ignores_own_addresses() {
        let mut b = Builder::new();
        let n = b.add_node(true, 1, &[], &["127.0.0.1:1"], "", b"").unwrap();
        b.add_node(true, 1, &[], &["127.0.0.1:2"], "", b"").unwrap();
        b.set_addresses(n.id(), &["127.0.0.1:1", "127.0.0.1:3"]).unwrap();
        assert!(b.set_addresses(n.id(), &["127.0.0.1:2"]).is_err());
        assert_eq!(b.node(n.id()).unwrap().address(1), Some("127.0.0.1:3"));
    }

    #[test]
    fn test_unknown_node_mutation() {
        let mut b = Builder::new();
        assert!(matches!(b.set_capacity(42, 1), Err(RingError::UnknownNode(42))));
        assert!(matches!(b.remove_node(42), Err(RingError::UnknownNode(42))));
    }

    #[test]
    fn test_every_partition_has_replica_count_owners() {
        let mut b = builder_with(5, 3);
        let ring = b.ring().unwrap();
        assert_eq!(ring.partition_count(), 256);
        for p in 0..ring.partition_count() {
            let owners = ring.responsible_ids(p);
            assert_eq!(owners.len(), 3);
            let unique: HashSet<_> = owners.iter().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut b = builder_with(3, 2);
        let r1 = b.ring().unwrap();
        let r2 = b.ring().unwrap();
        b.add_node(true, 1, &[], &["127.0.0.1:1234"], "", b"").unwrap();
        let r3 = b.ring().unwrap();
        assert!(r1.version() < r2.version());
        assert!(r2.version() < r3.version());
        assert_eq!(b.version(), r3.version());
    }

    #[test]
    fn test_failed_build_keeps_version_and_baseline() {
        let mut b = builder_with(2, 2);
        let r1 = b.ring().unwrap();

        b.set_replica_count(3).unwrap();
        let err = b.ring().unwrap_err();
        assert!(matches!(
            err,
            RingError::InsufficientNodes {
                needed: 3,
                available: 2
            }
        ));
        assert_eq!(b.version(), r1.version());

        b.set_replica_count(2).unwrap();
        let r2 = b.ring().unwrap();
        assert_eq!(r2.version(), r1.version() + 1);
        assert_eq!(r1.moved_partitions(&r2), 0);
    }

    #[test]
    fn test_inactive_and_zero_capacity_nodes_own_nothing() {
        let mut b = builder_with(3, 1);
        b.set_active(1, false).unwrap();
        b.set_capacity(2, 0).unwrap();
        let ring = b.ring().unwrap();
        for p in 0..ring.partition_count() {
            assert_eq!(ring.responsible_ids(p), &[3]);
        }
        assert_eq!(ring.nodes().len(), 3, "ineligible nodes stay in the ring");
    }

    #[test]
    fn test_adding_nodes_moves_fewer_partitions_than_rebuilding() {
        let mut b = builder_with(3, 2);
        let before = b.ring().unwrap();
        b.add_node(true, 1, &[], &["127.0.0.1:7000"], "", b"").unwrap();
        let after = b.ring().unwrap();

        let mut fresh = builder_with(4, 2);
        fresh.set_addresses(4, &["127.0.0.1:7000"]).unwrap();
        let scratch = fresh.ring().unwrap();

        let incremental = before.moved_partitions(&after);
        assert!(incremental > 0);
        assert!(
            incremental < before.moved_partitions(&scratch),
            "incremental rebuild moved {incremental} partitions"
        );
        for m in Ring::diff(&before, &after) {
            assert_eq!(m.to, vec![4], "only the new node gains partitions");
        }
    }

    #[test]
    fn test_load_rejects_mismatched_baseline() {
        use crate::codec::Persist;

        let mut b = builder_with(3, 2);
        b.ring().unwrap();
        b.last_assignment.truncate(100);
        let mut buf = Vec::new();
        b.persist(&mut buf).unwrap();
        assert!(matches!(
            Builder::load(buf.as_slice()),
            Err(RingError::Corrupt(_))
        ));

        let mut b = builder_with(3, 2);
        b.ring().unwrap();
        b.last_partition_bits = 30;
        let mut buf = Vec::new();
        b.persist(&mut buf).unwrap();
        assert!(matches!(
            Builder::load(buf.as_slice()),
            Err(RingError::Corrupt(_))
        ));
    }

    #[test]
    fn test_partition_bits_change_keeps_placement() {
        let mut b = builder_with(4, 2);
        b.set_partition_bits(4).unwrap();
        let small = b.ring().unwrap();

        b.set_partition_bits(6).unwrap();
        let large = b.ring().unwrap();
        for p in 0..large.partition_count() {
            assert_eq!(large.responsible_ids(p), small.responsible_ids(p >> 2));
        }
    }

    #[test]
    fn test_local_node_and_partition_lookup() {
        let mut b = builder_with(2, 2);
        let ring = b.ring().unwrap().with_local_node(1).unwrap();
        assert_eq!(ring.local_node().unwrap().address(0), Some("127.0.0.1:9000"));
        assert_eq!(ring.local_partitions().len(), 256);
        assert!(ring.responsible(17));
        assert_eq!(ring.partition_for_hash(u64::MAX), 255);
        assert_eq!(ring.partition_for_hash(0), 0);
        assert!(ring.responsible_nodes(256).is_empty());

        let err = ring.clone().with_local_node(99).unwrap_err();
        assert!(matches!(err, RingError::UnknownNode(99)));
    }
}
