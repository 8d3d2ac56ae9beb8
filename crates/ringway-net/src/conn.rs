//! One pooled connection to a peer.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Disconnected
//!                      |
//!                      +-> Disconnected (dial failed)
//! ```
//!
//! The write half sits behind an async mutex held for a whole frame, so
//! concurrent senders never interleave. The read half is owned by a
//! dedicated task running the inbound dispatch loop.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::timeout::TimeoutWriter;

/// Type-erased read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of a [`RingConn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Stateful wrapper around one connection to a peer address.
pub struct RingConn {
    addr: String,
    state: Mutex<ConnState>,
    /// Write half. `None` while disconnected.
    pub(crate) writer: tokio::sync::Mutex<Option<TimeoutWriter<BoxedWriter>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RingConn {
    pub(crate) fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: Mutex::new(ConnState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    /// Peer address this connection dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        let mut current = self.state.lock().expect("lock poisoned");
        if *current != state {
            debug!(addr = %self.addr, from = %*current, to = %state, "connection state change");
            *current = state;
        }
    }

    /// Record the task reading this connection, replacing any previous one.
    pub(crate) fn set_reader_task(&self, handle: JoinHandle<()>) {
        let previous = self
            .reader_task
            .lock()
            .expect("lock poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Tear the connection down: `Closing`, drop both halves, `Disconnected`.
    ///
    /// `abort_reader` must be false when called from the reader task itself.
    pub(crate) async fn release(&self, abort_reader: bool) {
        self.set_state(ConnState::Closing);
        let task = self.reader_task.lock().expect("lock poisoned").take();
        if abort_reader && let Some(task) = task {
            task.abort();
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Best effort: the peer may already be gone.
            let _ = writer.shutdown().await;
        }
        self.set_state(ConnState::Disconnected);
    }

    /// Take the writer lock for one frame.
    pub(crate) async fn lock_frame(&self) -> FrameGuard<'_> {
        FrameGuard {
            conn: self,
            writer: self.writer.lock().await,
            finished: false,
        }
    }

    /// Release with the writer lock already held by the caller.
    pub(crate) fn release_locked(&self, writer: &mut Option<TimeoutWriter<BoxedWriter>>) {
        self.set_state(ConnState::Closing);
        writer.take();
        if let Some(task) = self.reader_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        self.set_state(ConnState::Disconnected);
    }
}

/// Writer lock held across one frame.
///
/// Dropping the guard before [`finish`](FrameGuard::finish) releases the
/// connection, so a frame abandoned halfway (an error, or the sending future
/// being dropped) never has another frame written after it.
pub(crate) struct FrameGuard<'a> {
    conn: &'a RingConn,
    writer: tokio::sync::MutexGuard<'a, Option<TimeoutWriter<BoxedWriter>>>,
    finished: bool,
}

impl FrameGuard<'_> {
    /// Mark the frame complete and unlock the writer.
    pub(crate) fn finish(mut self) {
        self.finished = true;
    }
}

impl Deref for FrameGuard<'_> {
    type Target = Option<TimeoutWriter<BoxedWriter>>;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(addr = %self.conn.addr, "frame abandoned, releasing connection");
            self.conn.release_locked(&mut self.writer);
        }
    }
}

impl fmt::Debug for RingConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingConn")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
