//! Partition ring with tier-aware, capacity-weighted replica placement.
//!
//! A [`Builder`] accumulates [`Node`]s and produces immutable, versioned
//! [`Ring`] snapshots mapping each of `2^partition_bits` partitions to
//! `replica_count` distinct owner nodes:
//!
//! - Each node's share of partitions tracks its capacity.
//! - Replicas of one partition avoid sharing an innermost tier (rack, host)
//!   whenever the node pool allows it, and prefer differing outer tiers.
//! - Rebuilding keeps every partition whose owners are still eligible and
//!   within quota, so membership changes only move the partitions they must.
//!
//! Rings and builders are stored as gzip-compressed, header-tagged files
//! (see [`codec`]).

pub mod codec;
mod builder;
mod error;
mod node;
mod placement;
mod ring;

pub use builder::{Builder, DEFAULT_PARTITION_BITS, MAX_PARTITION_BITS};
pub use codec::{Persist, RingOrBuilder, load_ring_or_builder, persist_to_path};
pub use error::RingError;
pub use node::{Node, NodeId};
pub use ring::{Migration, Ring};
