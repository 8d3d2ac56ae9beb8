//! Error types for transport operations.

use std::io;

use ringway_placement::NodeId;

/// Errors that can occur while sending or receiving frames.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A read, flush or dial did not finish before its deadline.
    #[error("i/o timeout")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// Any other I/O failure (reset, broken pipe, ...).
    #[error("io error: {0}")]
    Io(io::Error),

    /// Dialing a peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address that was dialed.
        addr: String,
        /// The underlying dial error.
        #[source]
        source: io::Error,
    },

    /// The node is not part of the current ring.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The node has no address to dial.
    #[error("node {0} has no address")]
    NoAddress(NodeId),

    /// The ring has no local node to listen on.
    #[error("ring has no local node")]
    NoLocalNode,

    /// An inbound frame carried a type with no registered handler.
    #[error("no handler registered for message type {0}")]
    UnknownMsgType(u64),

    /// An inbound frame declared more content than the configured limit.
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared content length.
        length: u64,
        /// Configured maximum.
        max: u64,
    },

    /// A message wrote a different number of bytes than it declared.
    #[error("message declared {declared} bytes but wrote {written}")]
    LengthMismatch {
        /// Declared content length.
        declared: u64,
        /// Bytes actually written.
        written: u64,
    },

    /// A message handler rejected its frame.
    #[error("handler error: {0}")]
    Handler(String),

    /// The caller routed with a ring version the transport no longer holds.
    #[error("ring version mismatch: caller has {expected}, transport has {actual}")]
    RingVersionMismatch {
        /// Version the caller asked for.
        expected: u64,
        /// Version currently installed.
        actual: u64,
    },

    /// Some sends of a fan-out failed. The others were delivered.
    #[error("{} of {attempted} replica sends failed", .failures.len())]
    Fanout {
        /// Number of destinations attempted.
        attempted: usize,
        /// Per-destination failures.
        failures: Vec<(NodeId, NetError)>,
    },
}

impl NetError {
    /// Whether this error is a deadline expiry rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            NetError::Timeout => true,
            NetError::Connect { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => NetError::Timeout,
            io::ErrorKind::UnexpectedEof => NetError::Closed,
            _ => NetError::Io(e),
        }
    }
}
