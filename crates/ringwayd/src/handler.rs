//! Inbound frame handler for `ringwayd serve`.

use ringway_net::{MsgHandler, NetError};
use tokio::io::AsyncRead;
use tracing::info;

/// Logs every frame of one message type and discards its content.
#[derive(Debug)]
pub struct FrameLogger {
    msg_type: u64,
}

impl FrameLogger {
    pub fn new(msg_type: u64) -> Self {
        Self { msg_type }
    }
}

#[async_trait::async_trait]
impl MsgHandler for FrameLogger {
    async fn handle(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64, NetError> {
        let consumed = tokio::io::copy(reader, &mut tokio::io::sink()).await?;
        info!(msg_type = self.msg_type, length, consumed, "received frame");
        Ok(consumed)
    }
}
