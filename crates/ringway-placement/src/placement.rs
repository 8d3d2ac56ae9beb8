//! Replica assignment.
//!
//! [`place`] is a pure function from (previous assignment, node set, replica
//! count, partition count) to a new assignment. It works in three passes:
//!
//! 1. **Keep**: every previous owner that is still assignable keeps its slot,
//!    unless it duplicates or shares an innermost tier with an owner already
//!    kept for the same partition (only enforced when the pool has enough
//!    distinct groups to make diversity possible).
//! 2. **Shed**: nodes holding more slots than their capacity quota give up
//!    the excess, at most one slot per partition per sweep.
//! 3. **Fill**: every empty slot is given to the best candidate: tier-diverse
//!    first, then nodes still under quota, then the least tier overlap with
//!    the other owners, then the largest deficit, then the lowest node ID.
//!
//! Partitions are visited in a fixed odd-stride permutation so the slots shed
//! by overloaded nodes are spread across the partition space instead of being
//! a contiguous block. No randomness is involved: identical input always
//! yields the identical assignment.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::error::RingError;
use crate::node::{Node, NodeId};

/// Odd multiplier; `p * STRIDE mod 2^bits` is a permutation of the partitions.
const STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Result of a placement pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Partition -> ordered owners, each of length `replica_count`.
    pub assignment: Vec<Vec<NodeId>>,
    /// Partitions whose owners could not be kept in distinct innermost tiers.
    pub degraded: usize,
}

struct Candidate<'a> {
    id: NodeId,
    tiers: &'a [String],
}

impl Candidate<'_> {
    /// Same innermost group. Nodes without tiers are groups of their own.
    fn conflicts(&self, other: &Candidate<'_>) -> bool {
        !self.tiers.is_empty() && self.tiers == other.tiers
    }

    /// Number of leading tier levels shared with `other`.
    fn shared_depth(&self, other: &Candidate<'_>) -> usize {
        self.tiers
            .iter()
            .zip(other.tiers)
            .take_while(|(a, b)| a == b)
            .count()
    }
}

/// Compute a new assignment. `nodes` must be sorted by ascending ID.
pub(crate) fn place(
    previous: &[Vec<NodeId>],
    nodes: &[Node],
    replica_count: usize,
    partition_count: usize,
) -> Result<Placement, RingError> {
    let candidates: Vec<Candidate<'_>> = nodes
        .iter()
        .filter(|n| n.assignable())
        .map(|n| Candidate {
            id: n.id,
            tiers: &n.tiers,
        })
        .collect();

    if replica_count == 0 {
        return Err(RingError::InvalidReplicaCount(replica_count));
    }
    if candidates.len() < replica_count {
        return Err(RingError::InsufficientNodes {
            needed: replica_count,
            available: candidates.len(),
        });
    }

    let capacities: Vec<u32> = nodes
        .iter()
        .filter(|n| n.assignable())
        .map(|n| n.capacity)
        .collect();
    let quotas = quotas(&capacities, partition_count, replica_count);
    let index: HashMap<NodeId, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();
    let diversity_possible = distinct_groups(&candidates) >= replica_count;
    let order = visit_order(partition_count);

    let mut assigned = vec![0usize; candidates.len()];
    let mut slots: Vec<Vec<Option<usize>>> = vec![vec![None; replica_count]; partition_count];

    // Keep.
    for (partition, owners) in previous.iter().enumerate().take(partition_count) {
        for (slot, owner) in owners.iter().take(replica_count).enumerate() {
            let Some(&ci) = index.get(owner) else {
                continue;
            };
            let row = &slots[partition];
            let clashes = row.iter().flatten().any(|&other| {
                other == ci
                    || (diversity_possible && candidates[ci].conflicts(&candidates[other]))
            });
            if !clashes {
                slots[partition][slot] = Some(ci);
                assigned[ci] += 1;
            }
        }
    }

    // Shed. One slot per partition per sweep, last replica first, so an
    // overloaded pair never vacates the same partition together.
    loop {
        let mut shed = false;
        for &partition in &order {
            let over = slots[partition]
                .iter()
                .rposition(|s| s.is_some_and(|ci| assigned[ci] > quotas[ci]));
            if let Some(slot) = over
                && let Some(ci) = slots[partition][slot].take()
            {
                assigned[ci] -= 1;
                shed = true;
            }
        }
        if !shed {
            break;
        }
    }

    // Fill.
    for &partition in &order {
        for slot in 0..replica_count {
            if slots[partition][slot].is_some() {
                continue;
            }
            let owners: Vec<usize> = slots[partition].iter().flatten().copied().collect();
            let best = (0..candidates.len())
                .filter(|ci| !owners.contains(ci))
                .min_by_key(|&ci| {
                    let candidate = &candidates[ci];
                    let conflict = owners.iter().any(|&o| candidate.conflicts(&candidates[o]));
                    let depth = owners
                        .iter()
                        .map(|&o| candidate.shared_depth(&candidates[o]))
                        .max()
                        .unwrap_or(0);
                    let need = quotas[ci] as i64 - assigned[ci] as i64;
                    (conflict, need <= 0, depth, Reverse(need), candidate.id)
                });
            // At least `replica_count` candidates exist, so one is always free.
            if let Some(ci) = best {
                slots[partition][slot] = Some(ci);
                assigned[ci] += 1;
            }
        }
    }

    let mut degraded = 0;
    let assignment = slots
        .into_iter()
        .map(|row| {
            let owners: Vec<usize> = row.into_iter().flatten().collect();
            let clash = owners.iter().enumerate().any(|(i, &a)| {
                owners[i + 1..]
                    .iter()
                    .any(|&b| candidates[a].conflicts(&candidates[b]))
            });
            if clash {
                degraded += 1;
            }
            owners.into_iter().map(|ci| candidates[ci].id).collect()
        })
        .collect();

    Ok(Placement {
        assignment,
        degraded,
    })
}

/// Integer slot quotas proportional to capacity, summing to
/// `partition_count * replica_count`.
///
/// A node can own a partition at most once, so no quota exceeds
/// `partition_count`; nodes whose exact share would exceed it are capped and
/// the remainder is spread over the others. Fractional shares are resolved
/// by largest remainder, ties going to the lower index.
fn quotas(capacities: &[u32], partition_count: usize, replica_count: usize) -> Vec<usize> {
    let mut quotas = vec![0usize; capacities.len()];
    let mut capped = vec![false; capacities.len()];
    let mut remaining = (partition_count * replica_count) as u128;
    let ceiling = partition_count as u128;

    loop {
        let open: Vec<usize> = (0..capacities.len()).filter(|&i| !capped[i]).collect();
        let weight: u128 = open.iter().map(|&i| u128::from(capacities[i])).sum();
        if remaining == 0 || weight == 0 {
            return quotas;
        }

        let heaviest = open
            .iter()
            .copied()
            .max_by_key(|&i| (capacities[i], Reverse(i)));
        if let Some(i) = heaviest
            && remaining * u128::from(capacities[i]) > ceiling * weight
        {
            quotas[i] = partition_count;
            capped[i] = true;
            remaining -= ceiling;
            continue;
        }

        let mut leftover = remaining;
        let mut remainders = Vec::with_capacity(open.len());
        for &i in &open {
            let exact = remaining * u128::from(capacities[i]);
            let share = exact / weight;
            quotas[i] = share as usize;
            leftover -= share;
            remainders.push((Reverse(exact % weight), i));
        }
        remainders.sort();
        for (_, i) in remainders.into_iter().take(leftover as usize) {
            quotas[i] += 1;
        }
        return quotas;
    }
}

fn distinct_groups(candidates: &[Candidate<'_>]) -> usize {
    let mut groups: Vec<&[String]> = Vec::new();
    let mut ungrouped = 0;
    for c in candidates {
        if c.tiers.is_empty() {
            ungrouped += 1;
        } else if !groups.contains(&c.tiers) {
            groups.push(c.tiers);
        }
    }
    groups.len() + ungrouped
}

fn visit_order(partition_count: usize) -> Vec<usize> {
    let mask = (partition_count as u64).wrapping_sub(1);
    (0..partition_count as u64)
        .map(|p| (p.wrapping_mul(STRIDE) & mask) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn node(id: NodeId, capacity: u32, tiers: &[&str]) -> Node {
        Node {
            id,
            active: true,
            capacity,
            tiers: tiers.iter().map(|t| t.to_string()).collect(),
            addresses: vec![format!("127.0.0.1:{}", 9000 + id)],
            meta: String::new(),
            conf: Vec::new(),
        }
    }

    fn counts(assignment: &[Vec<NodeId>]) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for owners in assignment {
            for id in owners {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }

    fn moved(a: &[Vec<NodeId>], b: &[Vec<NodeId>]) -> usize {
        a.iter()
            .zip(b)
            .filter(|(x, y)| {
                let x: HashSet<_> = x.iter().collect();
                let y: HashSet<_> = y.iter().collect();
                x != y
            })
            .count()
    }

    #[test]
    fn test_visit_order_is_a_permutation() {
        let order = visit_order(256);
        let unique: HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), 256);
        assert!(order.iter().all(|&p| p < 256));
    }

    #[test]
    fn test_quotas_follow_capacity() {
        assert_eq!(quotas(&[1, 3], 256, 1), vec![64, 192]);
        assert_eq!(quotas(&[1, 1, 1], 256, 1), vec![86, 85, 85]);
        assert_eq!(quotas(&[5, 5], 16, 2), vec![16, 16]);
    }

    #[test]
    fn test_quotas_cap_at_partition_count() {
        // The heavy node cannot own a partition twice.
        let q = quotas(&[100, 1, 1], 64, 2);
        assert_eq!(q[0], 64);
        assert_eq!(q[1] + q[2], 64);
        assert_eq!(q.iter().sum::<usize>(), 128);
    }

    #[test]
    fn test_every_partition_gets_distinct_owners() {
        let nodes: Vec<Node> = (1..=5).map(|i| node(i, 1, &[])).collect();
        let placement = place(&[], &nodes, 3, 256).unwrap();
        for owners in &placement.assignment {
            assert_eq!(owners.len(), 3);
            let unique: HashSet<_> = owners.iter().collect();
            assert_eq!(unique.len(), 3);
        }
        assert_eq!(placement.degraded, 0);
    }

    #[test]
    fn test_capacity_weighted_shares_are_exact_for_single_replica() {
        let nodes = vec![node(1, 1, &[]), node(2, 3, &[])];
        let placement = place(&[], &nodes, 1, 256).unwrap();
        let counts = counts(&placement.assignment);
        assert_eq!(counts[&1], 64);
        assert_eq!(counts[&2], 192);
    }

    #[test]
    fn test_replicas_spread_across_racks() {
        let nodes = vec![
            node(1, 1, &["zone", "rack-a"]),
            node(2, 1, &["zone", "rack-a"]),
            node(3, 1, &["zone", "rack-b"]),
            node(4, 1, &["zone", "rack-b"]),
        ];
        let placement = place(&[], &nodes, 2, 256).unwrap();
        for owners in &placement.assignment {
            let racks: HashSet<_> = owners
                .iter()
                .map(|id| nodes[*id as usize - 1].tiers.clone())
                .collect();
            assert_eq!(racks.len(), 2, "replicas share a rack: {owners:?}");
        }
        assert_eq!(placement.degraded, 0);
    }

    #[test]
    fn test_outer_tiers_preferred_when_possible() {
        let nodes = vec![
            node(1, 1, &["zone-1", "rack-a"]),
            node(2, 1, &["zone-1", "rack-b"]),
            node(3, 1, &["zone-2", "rack-c"]),
            node(4, 1, &["zone-2", "rack-d"]),
        ];
        let placement = place(&[], &nodes, 2, 64).unwrap();
        for owners in &placement.assignment {
            let zones: HashSet<_> = owners
                .iter()
                .map(|id| nodes[*id as usize - 1].tiers[0].clone())
                .collect();
            assert_eq!(zones.len(), 2, "replicas share a zone: {owners:?}");
        }
    }

    #[test]
    fn test_scarce_tiers_degrade_instead_of_failing() {
        let nodes = vec![
            node(1, 1, &["rack-a"]),
            node(2, 1, &["rack-a"]),
            node(3, 1, &["rack-a"]),
        ];
        let placement = place(&[], &nodes, 2, 32).unwrap();
        assert_eq!(placement.degraded, 32);
        for owners in &placement.assignment {
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_insufficient_nodes() {
        let nodes = vec![node(1, 1, &[]), node(2, 0, &[])];
        let err = place(&[], &nodes, 2, 16).unwrap_err();
        assert!(matches!(
            err,
            RingError::InsufficientNodes {
                needed: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn test_adding_a_node_moves_only_its_quota() {
        let mut nodes: Vec<Node> = (1..=3).map(|i| node(i, 1, &[])).collect();
        let before = place(&[], &nodes, 1, 256).unwrap().assignment;

        nodes.push(node(4, 1, &[]));
        let after = place(&before, &nodes, 1, 256).unwrap().assignment;
        let scratch = place(&[], &nodes, 1, 256).unwrap().assignment;

        let incremental = moved(&before, &after);
        assert_eq!(incremental, 64);
        assert!(incremental < moved(&before, &scratch));
        assert_eq!(counts(&after)[&4], 64);
    }

    #[test]
    fn test_tiered_growth_moves_little_and_stays_diverse() {
        let racks = [
            ["zone-1", "rack-a"],
            ["zone-1", "rack-a"],
            ["zone-1", "rack-b"],
            ["zone-1", "rack-b"],
            ["zone-2", "rack-c"],
            ["zone-2", "rack-c"],
            ["zone-2", "rack-d"],
            ["zone-2", "rack-d"],
            ["zone-3", "rack-e"],
        ];
        let mut nodes: Vec<Node> = racks[..8]
            .iter()
            .zip(1..)
            .map(|(tiers, id)| node(id, 1, tiers))
            .collect();
        let before = place(&[], &nodes, 2, 256).unwrap().assignment;

        nodes.push(node(9, 1, &racks[8]));
        let grown = place(&before, &nodes, 2, 256).unwrap();
        let after = grown.assignment;
        let scratch = place(&[], &nodes, 2, 256).unwrap().assignment;

        let incremental = moved(&before, &after);
        assert!(incremental > 0);
        assert!(
            incremental < moved(&before, &scratch),
            "incremental placement moved {incremental} partitions"
        );

        let again = place(&after, &nodes, 2, 256).unwrap().assignment;
        assert_eq!(moved(&after, &again), 0);

        assert_eq!(grown.degraded, 0);
        for owners in &after {
            let racks: HashSet<_> = owners
                .iter()
                .map(|id| nodes[*id as usize - 1].tiers.clone())
                .collect();
            assert_eq!(racks.len(), owners.len(), "replicas share a rack: {owners:?}");
        }
    }

    #[test]
    fn test_removing_a_node_moves_only_its_partitions() {
        let mut nodes: Vec<Node> = (1..=4).map(|i| node(i, 1, &[])).collect();
        let before = place(&[], &nodes, 2, 128).unwrap().assignment;

        nodes.retain(|n| n.id != 3);
        let after = place(&before, &nodes, 2, 128).unwrap().assignment;

        for (old, new) in before.iter().zip(&after) {
            if !old.contains(&3) {
                assert_eq!(old, new);
            }
            assert!(!new.contains(&3));
        }
    }

    #[test]
    fn test_unchanged_input_is_stable() {
        let nodes: Vec<Node> = (1..=4).map(|i| node(i, i as u32, &[])).collect();
        let first = place(&[], &nodes, 2, 128).unwrap().assignment;
        let second = place(&first, &nodes, 2, 128).unwrap().assignment;
        assert_eq!(first, second);
        assert_eq!(first, place(&[], &nodes, 2, 128).unwrap().assignment);
    }
}
