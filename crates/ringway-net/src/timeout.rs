//! Deadline-bounded buffered I/O.
//!
//! [`TimeoutReader`] and [`TimeoutWriter`] wrap one half of a connection.
//! Each read, and each write or flush that has to wait on the socket, gets a
//! fresh deadline of `timeout`; when it expires the operation fails with
//! [`io::ErrorKind::TimedOut`], which converts to
//! [`NetError::Timeout`](crate::NetError::Timeout).
//!
//! A zero timeout expires immediately: reads and flushes fail without
//! touching the socket. Writes land in the buffer and only reach the socket
//! on flush, which is where the write deadline is enforced.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

/// Rolling deadline shared by the reader and writer wrappers.
#[derive(Debug)]
struct Deadline {
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl Deadline {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: None,
            armed: false,
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.armed = false;
    }

    /// Bound an inner poll result by the deadline.
    ///
    /// The deadline is armed the first time the operation has to wait and
    /// disarmed once the operation completes.
    fn bound<T>(&mut self, cx: &mut Context<'_>, result: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if result.is_ready() {
            self.armed = false;
            return result;
        }
        if self.timeout.is_zero() {
            return Poll::Ready(Err(timed_out()));
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if !self.armed {
            sleep.as_mut().reset(deadline);
            self.armed = true;
        }
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.armed = false;
                Poll::Ready(Err(timed_out()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Buffered reader that fails reads exceeding a deadline.
#[derive(Debug)]
pub struct TimeoutReader<R> {
    inner: BufReader<R>,
    deadline: Deadline,
}

impl<R: AsyncRead> TimeoutReader<R> {
    pub fn new(inner: R, buffer_size: usize, timeout: Duration) -> Self {
        Self {
            inner: BufReader::with_capacity(buffer_size, inner),
            deadline: Deadline::new(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.deadline.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline.set_timeout(timeout);
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TimeoutReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.deadline.timeout.is_zero() {
            return Poll::Ready(Err(timed_out()));
        }
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.deadline.bound(cx, result)
    }
}

/// Buffered writer whose flushes fail when they exceed a deadline.
#[derive(Debug)]
pub struct TimeoutWriter<W> {
    inner: BufWriter<W>,
    deadline: Deadline,
}

impl<W: AsyncWrite> TimeoutWriter<W> {
    pub fn new(inner: W, buffer_size: usize, timeout: Duration) -> Self {
        Self {
            inner: BufWriter::with_capacity(buffer_size, inner),
            deadline: Deadline::new(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.deadline.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline.set_timeout(timeout);
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TimeoutWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.deadline.bound(cx, result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.deadline.timeout.is_zero() {
            return Poll::Ready(Err(timed_out()));
        }
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        this.deadline.bound(cx, result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.deadline.bound(cx, result)
    }
}
