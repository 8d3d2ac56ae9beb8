//! Message contracts and the wire frame.
//!
//! Every frame is a big-endian `u64` message type, a big-endian `u64`
//! content length, then exactly that many content bytes:
//!
//! ```text
//! +----------------+----------------+------------------------+
//! | type (u64, BE) | length (u64,BE)| content (length bytes) |
//! +----------------+----------------+------------------------+
//! ```
//!
//! The transport never interprets content. Outbound payloads implement
//! [`Msg`]; inbound payloads are consumed by a [`MsgHandler`] registered
//! for their type.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Size of the frame header: type plus length.
pub const HEADER_LEN: usize = 16;

/// An outbound payload.
#[async_trait::async_trait]
pub trait Msg: Send + Sync {
    /// Type tag written in the frame header.
    fn msg_type(&self) -> u64;

    /// Number of content bytes [`write_content`](Msg::write_content) writes.
    fn msg_length(&self) -> u64;

    /// Stream exactly `msg_length()` bytes to `writer`, returning the count.
    async fn write_content(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, NetError>;

    /// Called once per send attempt, after the attempt finished.
    fn done(&self) {}
}

/// Consumer of inbound frames of one message type.
#[async_trait::async_trait]
pub trait MsgHandler: Send + Sync {
    /// Consume `length` bytes from `reader`, returning the count consumed.
    ///
    /// `reader` ends after `length` bytes. Bytes left unread are discarded
    /// by the transport; an error closes the connection.
    async fn handle(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64, NetError>;
}

/// Encode a frame header.
pub fn encode_header(msg_type: u64, length: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(&msg_type.to_be_bytes());
    header[8..].copy_from_slice(&length.to_be_bytes());
    header
}

/// Write one complete frame for `msg` and flush it.
///
/// Fails with [`NetError::LengthMismatch`] when the message writes a
/// different number of bytes than it declared; the stream is then out of
/// frame and must be closed.
pub(crate) async fn write_frame<W>(writer: &mut W, msg: &dyn Msg) -> Result<(), NetError>
where
    W: AsyncWrite + Send + Unpin,
{
    let declared = msg.msg_length();
    writer
        .write_all(&encode_header(msg.msg_type(), declared))
        .await?;
    let written = msg.write_content(writer).await?;
    if written != declared {
        return Err(NetError::LengthMismatch { declared, written });
    }
    writer.flush().await?;
    Ok(())
}
