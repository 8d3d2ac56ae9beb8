//! Ring-routed TCP transport.
//!
//! [`TcpMsgRing`] resolves node IDs through the current [`Ring`], keeps one
//! pooled [`RingConn`] per peer address and:
//! - Writes frames to a node, dialing on demand.
//! - Fans a frame out to the other replicas of a partition.
//! - Runs the inbound dispatch loop on every connection, handing each frame
//!   to the [`MsgHandler`] registered for its type.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ringway_placement::{NodeId, Ring};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::conn::{BoxedReader, BoxedWriter, ConnState, RingConn};
use crate::error::NetError;
use crate::message::{Msg, MsgHandler, write_frame};
use crate::timeout::{TimeoutReader, TimeoutWriter};

/// Default upper bound on a frame's declared content length: 64 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: u64 = 64 * 1024 * 1024;

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct MsgRingConfig {
    /// Deadline for each read on a connection.
    pub read_timeout: Duration,
    /// Deadline for each flush of a frame.
    pub write_timeout: Duration,
    /// Deadline for dialing a peer.
    pub connect_timeout: Duration,
    /// Read and write buffer size per connection.
    pub buffer_size: usize,
    /// Largest content length accepted on inbound frames.
    pub max_frame_length: u64,
}

impl Default for MsgRingConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            buffer_size: 16 * 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// A connection whose read loop ended with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFault {
    /// Peer address.
    pub addr: String,
    /// Rendered error.
    pub error: String,
    /// Whether the error was a deadline expiry.
    pub timeout: bool,
}

struct Inner {
    ring: RwLock<Arc<Ring>>,
    /// Outbound connections keyed by peer address.
    ///
    /// Held only to look up, insert or evict entries; never across I/O.
    conns: Mutex<HashMap<String, Arc<RingConn>>>,
    handlers: RwLock<HashMap<u64, Arc<dyn MsgHandler>>>,
    config: MsgRingConfig,
    faults: broadcast::Sender<ConnectionFault>,
    closed: watch::Sender<bool>,
}

/// Message transport routed through a partition ring.
///
/// Cheap to clone; clones share the pool, handlers and ring.
#[derive(Clone)]
pub struct TcpMsgRing {
    inner: Arc<Inner>,
}

impl TcpMsgRing {
    pub fn new(ring: Ring) -> Self {
        Self::with_config(ring, MsgRingConfig::default())
    }

    pub fn with_config(ring: Ring, config: MsgRingConfig) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                ring: RwLock::new(Arc::new(ring)),
                conns: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                config,
                faults,
                closed,
            }),
        }
    }

    pub fn config(&self) -> &MsgRingConfig {
        &self.inner.config
    }

    /// The ring currently used for routing.
    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.inner.ring.read().expect("lock poisoned"))
    }

    /// Swap in a new ring. Sends already in flight keep the old one.
    pub fn set_ring(&self, ring: Ring) {
        let version = ring.version();
        *self.inner.ring.write().expect("lock poisoned") = Arc::new(ring);
        debug!(version, "installed ring");
    }

    /// Register (or replace) the handler for inbound frames of `msg_type`.
    pub fn set_msg_handler(&self, msg_type: u64, handler: Arc<dyn MsgHandler>) {
        self.inner
            .handlers
            .write()
            .expect("lock poisoned")
            .insert(msg_type, handler);
    }

    /// Observe connections whose read loop failed.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<ConnectionFault> {
        self.inner.faults.subscribe()
    }

    // -------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------

    /// Write one frame for `msg` to `node_id`, dialing if needed.
    ///
    /// `msg.done()` is called once the attempt has finished, whatever its
    /// outcome.
    pub async fn msg_to_node(&self, node_id: NodeId, msg: &dyn Msg) -> Result<(), NetError> {
        let result = self.send(node_id, msg).await;
        msg.done();
        result
    }

    /// Send in the background and report the outcome on `done`.
    pub fn msg_to_node_chan(
        &self,
        node_id: NodeId,
        msg: Arc<dyn Msg>,
        done: oneshot::Sender<Result<(), NetError>>,
    ) {
        let transport = self.clone();
        tokio::spawn(async move {
            let result = transport.msg_to_node(node_id, &*msg).await;
            // The caller may have stopped listening.
            let _ = done.send(result);
        });
    }

    /// Send `msg` to every owner of `partition` except the local node.
    ///
    /// Sends run concurrently and are all awaited; failures are collected
    /// into [`NetError::Fanout`] without cancelling the other sends.
    pub async fn msg_to_other_replicas(
        &self,
        ring_version: u64,
        partition: u32,
        msg: Arc<dyn Msg>,
    ) -> Result<(), NetError> {
        let ring = self.ring();
        if ring.version() != ring_version {
            return Err(NetError::RingVersionMismatch {
                expected: ring_version,
                actual: ring.version(),
            });
        }

        let local = ring.local_node_id();
        let targets: Vec<NodeId> = ring
            .responsible_ids(partition)
            .iter()
            .copied()
            .filter(|id| Some(*id) != local)
            .collect();

        let mut sends = Vec::with_capacity(targets.len());
        for node_id in targets {
            let transport = self.clone();
            let msg = Arc::clone(&msg);
            let handle =
                tokio::spawn(async move { transport.msg_to_node(node_id, &*msg).await });
            sends.push((node_id, handle));
        }

        let attempted = sends.len();
        let mut failures = Vec::new();
        for (node_id, handle) in sends {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push((node_id, e)),
                Err(e) => failures.push((node_id, NetError::from(io::Error::from(e)))),
            }
        }

        if failures.is_empty() {
            trace!(partition, attempted, "replica fan-out delivered");
            Ok(())
        } else {
            warn!(partition, attempted, failed = failures.len(), "replica fan-out incomplete");
            Err(NetError::Fanout {
                attempted,
                failures,
            })
        }
    }

    async fn send(&self, node_id: NodeId, msg: &dyn Msg) -> Result<(), NetError> {
        let addr = self.resolve(node_id)?;
        let conn = self.pooled(&addr).await;

        let mut frame = conn.lock_frame().await;
        if frame.is_none() {
            *frame = Some(self.dial(&conn).await?);
            // A read loop may have evicted this entry while it was idle.
            self.inner
                .conns
                .lock()
                .await
                .entry(addr.clone())
                .or_insert_with(|| Arc::clone(&conn));
        }
        let Some(w) = frame.as_mut() else {
            return Err(NetError::Closed);
        };

        // Until `finish`, dropping `frame` releases the connection.
        match write_frame(w, msg).await {
            Ok(()) => {
                frame.finish();
                trace!(%addr, node_id, msg_type = msg.msg_type(), "frame sent");
                Ok(())
            }
            Err(e) => {
                warn!(%addr, node_id, error = %e, "send failed, closing connection");
                drop(frame);
                self.evict(&addr, &conn).await;
                Err(e)
            }
        }
    }

    fn resolve(&self, node_id: NodeId) -> Result<String, NetError> {
        let ring = self.ring();
        let node = ring.node(node_id).ok_or(NetError::UnknownNode(node_id))?;
        node.address(0)
            .map(str::to_string)
            .ok_or(NetError::NoAddress(node_id))
    }

    /// Pooled connection for `addr`, creating a disconnected one if absent.
    async fn pooled(&self, addr: &str) -> Arc<RingConn> {
        let mut pool = self.inner.conns.lock().await;
        Arc::clone(
            pool.entry(addr.to_string())
                .or_insert_with(|| Arc::new(RingConn::new(addr))),
        )
    }

    /// Remove `conn` from the pool unless it was already replaced.
    async fn evict(&self, addr: &str, conn: &Arc<RingConn>) {
        let mut pool = self.inner.conns.lock().await;
        if pool.get(addr).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            pool.remove(addr);
        }
    }

    /// Dial `conn`'s peer and start its read loop. Called with the writer
    /// lock held.
    async fn dial(&self, conn: &Arc<RingConn>) -> Result<TimeoutWriter<BoxedWriter>, NetError> {
        let addr = conn.addr().to_string();
        conn.set_state(ConnState::Connecting);

        let connect = TcpStream::connect(addr.as_str());
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                conn.set_state(ConnState::Disconnected);
                return Err(NetError::Connect { addr, source });
            }
            Err(_) => {
                conn.set_state(ConnState::Disconnected);
                return Err(NetError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }

        debug!(%addr, "connected to peer");
        let (read_half, write_half) = stream.into_split();
        Ok(self.attach(conn, Box::new(read_half), Box::new(write_half)))
    }

    fn attach(
        &self,
        conn: &Arc<RingConn>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> TimeoutWriter<BoxedWriter> {
        let config = &self.inner.config;
        conn.set_state(ConnState::Connected);

        let mut reader = TimeoutReader::new(reader, config.buffer_size, config.read_timeout);
        let transport = self.clone();
        let task_conn = Arc::clone(conn);
        let handle = tokio::spawn(async move {
            let err = transport.handle_forever(&mut reader).await;
            transport.connection_lost(&task_conn, err).await;
        });
        conn.set_reader_task(handle);

        TimeoutWriter::new(writer, config.buffer_size, config.write_timeout)
    }

    async fn connection_lost(&self, conn: &Arc<RingConn>, err: NetError) {
        warn!(addr = %conn.addr(), error = %err, "connection read loop ended");
        // Reported first: a concurrent release may abort this task at the
        // next await.
        self.report_fault(conn.addr(), &err);
        self.evict(conn.addr(), conn).await;
        conn.release(false).await;
    }

    fn report_fault(&self, addr: &str, err: &NetError) {
        // No subscribers is fine.
        let _ = self.inner.faults.send(ConnectionFault {
            addr: addr.to_string(),
            error: err.to_string(),
            timeout: err.is_timeout(),
        });
    }

    // -------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------

    /// Dispatch frames from `reader` until it fails, returning the error.
    ///
    /// Each frame's content is handed to its type's handler through a reader
    /// that ends after the declared length; whatever the handler leaves
    /// unread is discarded. Unknown types, oversized frames and handler
    /// errors end the loop.
    pub async fn handle_forever<R>(&self, reader: &mut R) -> NetError
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let msg_type = match reader.read_u64().await {
                Ok(v) => v,
                Err(e) => return e.into(),
            };
            let length = match reader.read_u64().await {
                Ok(v) => v,
                Err(e) => return e.into(),
            };

            let max = self.inner.config.max_frame_length;
            if length > max {
                warn!(msg_type, length, max, "oversized frame");
                return NetError::FrameTooLarge { length, max };
            }

            let handler = self
                .inner
                .handlers
                .read()
                .expect("lock poisoned")
                .get(&msg_type)
                .cloned();
            let Some(handler) = handler else {
                warn!(msg_type, length, "frame with unregistered message type");
                return NetError::UnknownMsgType(msg_type);
            };

            let mut content = (&mut *reader).take(length);
            match handler.handle(&mut content, length).await {
                Ok(consumed) => trace!(msg_type, length, consumed, "frame handled"),
                Err(e) => return e,
            }

            if content.limit() > 0 {
                if let Err(e) = tokio::io::copy(&mut content, &mut tokio::io::sink()).await {
                    return e.into();
                }
                if content.limit() > 0 {
                    return NetError::Closed;
                }
            }
        }
    }

    /// Primary address of the ring's local node.
    pub fn local_address(&self) -> Result<String, NetError> {
        let ring = self.ring();
        let node = ring.local_node().ok_or(NetError::NoLocalNode)?;
        node.address(0)
            .map(str::to_string)
            .ok_or(NetError::NoAddress(node.id()))
    }

    /// Bind a listener for inbound connections.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener, NetError> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr, "listening");
        Ok(listener)
    }

    /// Accept connections and run the dispatch loop on each until
    /// [`shutdown`](Self::shutdown).
    ///
    /// Inbound connections are read-only and are not pooled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetError> {
        let mut closed = self.inner.closed.subscribe();
        let mut readers = JoinSet::new();

        loop {
            if *closed.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => continue,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted connection");

                    let transport = self.clone();
                    let config = &self.inner.config;
                    let mut reader =
                        TimeoutReader::new(stream, config.buffer_size, config.read_timeout);
                    readers.spawn(async move {
                        let err = transport.handle_forever(&mut reader).await;
                        if matches!(err, NetError::Closed) {
                            debug!(%peer, "peer closed connection");
                        } else {
                            warn!(%peer, error = %err, "inbound connection failed");
                        }
                        transport.report_fault(&peer.to_string(), &err);
                    });
                    while readers.try_join_next().is_some() {}
                }
            }
        }

        readers.shutdown().await;
        debug!("stopped serving");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Pool management
    // -------------------------------------------------------------------

    /// State of the pooled connection to `addr`, if any.
    pub async fn connection_state(&self, addr: &str) -> Option<ConnState> {
        self.inner.conns.lock().await.get(addr).map(|c| c.state())
    }

    /// Close and evict the pooled connection to `addr`.
    ///
    /// Returns whether a connection was pooled. The next send dials again.
    pub async fn close_connection(&self, addr: &str) -> bool {
        let conn = self.inner.conns.lock().await.remove(addr);
        match conn {
            Some(conn) => {
                conn.release(true).await;
                true
            }
            None => false,
        }
    }

    /// Close every pooled connection and stop [`serve`](Self::serve).
    pub async fn shutdown(&self) {
        self.inner.closed.send_replace(true);
        let conns: Vec<_> = self.inner.conns.lock().await.drain().collect();
        for (_, conn) in conns {
            conn.release(true).await;
        }
        debug!("transport shut down");
    }
}
