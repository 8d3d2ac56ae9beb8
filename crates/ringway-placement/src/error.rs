//! Error types for ring building and ring file handling.

use crate::node::NodeId;

/// Errors produced by the builder, the ring and the persistence codec.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Fewer assignable nodes than the replica count requires.
    #[error("insufficient nodes: need {needed} active nodes with capacity, have {available}")]
    InsufficientNodes {
        /// Distinct owners required per partition.
        needed: usize,
        /// Active nodes with non-zero capacity.
        available: usize,
    },

    /// Replica count must be at least 1.
    #[error("invalid replica count: {0}")]
    InvalidReplicaCount(usize),

    /// Partition bits outside the supported range.
    #[error("invalid partition bits: {0} (supported range is 1..=24)")]
    InvalidPartitionBits(u16),

    /// Another node already uses this address and the builder forbids reuse.
    #[error("address {address} already used by node {node_id}")]
    DuplicateAddress {
        /// The contested address.
        address: String,
        /// The node already holding it.
        node_id: NodeId,
    },

    /// No node with this ID exists.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The stream does not start with a known ring or builder header.
    #[error("unrecognized ring file format: {0:?}")]
    UnrecognizedFormat(String),

    /// The header names a known entity but a version this build cannot read.
    #[error("unsupported {entity} format version {version}")]
    UnsupportedVersion {
        /// `"ring"` or `"builder"`.
        entity: &'static str,
        /// The version digits found in the header.
        version: String,
    },

    /// Encoding or decoding of the record body failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A decoded record breaks a structural invariant.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// An I/O error, including gzip failures and rename failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
