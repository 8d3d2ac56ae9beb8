//! Framed TCP messaging between the nodes of a partition ring.
//!
//! This crate moves opaque payloads between ring members:
//!
//! - [`Msg`] / [`MsgHandler`]: the outbound payload and inbound consumer
//!   contracts. The transport never interprets content.
//! - [`TimeoutReader`] / [`TimeoutWriter`]: buffered connection halves with a
//!   per-operation deadline.
//! - [`TcpMsgRing`]: resolves node IDs through a [`Ring`], pools one
//!   [`RingConn`] per peer, fans frames out to replicas and dispatches
//!   inbound frames.
//!
//! [`Ring`]: ringway_placement::Ring

mod conn;
mod error;
mod message;
mod timeout;
mod transport;

pub use conn::{BoxedReader, BoxedWriter, ConnState, RingConn};
pub use error::NetError;
pub use message::{HEADER_LEN, Msg, MsgHandler, encode_header};
pub use timeout::{TimeoutReader, TimeoutWriter};
pub use transport::{ConnectionFault, DEFAULT_MAX_FRAME_LENGTH, MsgRingConfig, TcpMsgRing};
