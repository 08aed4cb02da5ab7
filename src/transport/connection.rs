//! Byte-stream connection over a WebSocket session.
//!
//! [`StreamConn`] turns a sequence of binary WebSocket messages into an
//! ordered byte stream. Each `write` becomes exactly one binary message;
//! `read` hands out the bytes of the current message across as many calls
//! as the caller needs before waiting for the next one.
//!
//! # Read State Machine
//!
//! ```text
//!   ┌────────┐  binary message   ┌─────────┐
//!   │ empty  │──────────────────►│ pending │──┐ read(buf) copies
//!   └────────┘                   └─────────┘◄─┘ min(len, buf) bytes
//!        ▲                            │
//!        └────────── drained ─────────┘
//! ```
//!
//! The pending buffer holds the leftover of at most one message and is only
//! refilled once it is empty.
//!
//! # Locking
//!
//! The read half and the write half sit behind independent locks: one
//! reader and one writer proceed concurrently, readers (and writers) among
//! themselves are serialized.
//!
//! # Interrupted Writes
//!
//! A message handed to the session cannot be taken back. A write cut short
//! by its deadline, by `close` or by dropping its future leaves the session
//! with a partially sent message, so the connection is closed on the spot:
//! later reads and writes fail with `ConnectionClosed` and nothing further
//! is flushed to the peer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, pending};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use axum::extract::ws::WebSocket;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::frame::{CloseReason, Frame, SessionReader, SessionWriter, split_axum, split_tungstenite};
use super::io::StreamIo;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on sending the close frame during [`StreamConn::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// ReadHalf
// ============================================================================

/// Receiving side: the session stream plus the leftover of one message.
struct ReadHalf {
    /// Incoming messages.
    source: SessionReader,
    /// Unconsumed remainder of the last binary message.
    pending: Bytes,
    /// Peer closed the session or the stream ended.
    eof: bool,
}

impl ReadHalf {
    /// Returns up to `max` bytes, waiting for a message if nothing is pending.
    ///
    /// An empty result means end of stream.
    async fn next_chunk(&mut self, max: usize, conn_id: ConnectionId) -> Result<Bytes> {
        while self.pending.is_empty() {
            if self.eof {
                return Ok(Bytes::new());
            }

            match self.source.next().await {
                Some(Ok(Frame::Binary(data))) => {
                    trace!(%conn_id, len = data.len(), "Binary message received");
                    self.pending = data;
                }

                // Keepalive is answered by the WebSocket implementation
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}

                Some(Ok(Frame::Close(reason))) => {
                    debug!(%conn_id, ?reason, "WebSocket closed by remote");
                    self.eof = true;
                }

                Some(Ok(frame @ (Frame::Text(_) | Frame::Raw))) => {
                    warn!(%conn_id, kind = frame.kind(), "Non-binary message on stream connection");
                    return Err(Error::protocol(format!(
                        "unexpected {} message on stream connection",
                        frame.kind()
                    )));
                }

                Some(Err(e)) => return Err(e),

                None => {
                    debug!(%conn_id, "WebSocket stream ended");
                    self.eof = true;
                }
            }
        }

        let n = max.min(self.pending.len());
        Ok(self.pending.split_to(n))
    }
}

// ============================================================================
// StreamConn
// ============================================================================

/// Byte-stream connection carried by one WebSocket session.
///
/// Owns the session exclusively. Methods take `&self`, so a connection
/// wrapped in an `Arc` can be read by one task while another writes.
///
/// # Example
///
/// ```ignore
/// let conn = connector.dial(CancellationToken::new(), "ignored").await?;
/// conn.write(&[0x01, 0x02, 0x03]).await?;
///
/// let mut buf = [0u8; 2];
/// let n = conn.read(&mut buf).await?;
/// ```
pub struct StreamConn {
    /// Connection identifier for logs.
    id: ConnectionId,
    /// Local address, when the transport exposes one.
    local: Option<SocketAddr>,
    /// Remote address, when the transport exposes one.
    peer: Option<SocketAddr>,
    /// Read half and leftover buffer.
    reader: Mutex<ReadHalf>,
    /// Write half.
    writer: Mutex<SessionWriter>,
    /// Read deadline; updates reach reads already in flight.
    read_deadline: watch::Sender<Option<Instant>>,
    /// Write deadline; updates reach writes already in flight.
    write_deadline: watch::Sender<Option<Instant>>,
    /// Set once by `close` or by an interrupted write.
    closed: watch::Sender<bool>,
    /// A write was dropped after its message reached the session.
    write_abandoned: AtomicBool,
}

// ============================================================================
// StreamConn - Constructors
// ============================================================================

impl StreamConn {
    /// Wraps a `tokio-tungstenite` session (client side or raw socket).
    #[must_use]
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>, peer: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = split_tungstenite(ws);
        Self::from_halves(reader, writer, peer)
    }

    /// Wraps an upgraded axum session (server side).
    #[must_use]
    pub fn from_axum(ws: WebSocket, peer: Option<SocketAddr>) -> Self {
        let (reader, writer) = split_axum(ws);
        Self::from_halves(reader, writer, peer)
    }

    fn from_halves(reader: SessionReader, writer: SessionWriter, peer: Option<SocketAddr>) -> Self {
        let id = ConnectionId::next();
        debug!(conn_id = %id, ?peer, "Stream connection created");

        Self {
            id,
            local: None,
            peer,
            reader: Mutex::new(ReadHalf {
                source: reader,
                pending: Bytes::new(),
                eof: false,
            }),
            writer: Mutex::new(writer),
            read_deadline: watch::Sender::new(None),
            write_deadline: watch::Sender::new(None),
            closed: watch::Sender::new(false),
            write_abandoned: AtomicBool::new(false),
        }
    }

    /// Records the local address of the underlying socket.
    #[must_use]
    pub fn with_local_addr(mut self, local: Option<SocketAddr>) -> Self {
        self.local = local;
        self
    }
}

// ============================================================================
// StreamConn - Accessors
// ============================================================================

impl StreamConn {
    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the local address, if known.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Returns the remote address, if known.
    #[inline]
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Converts the connection into a `tokio::io` stream.
    #[must_use]
    pub fn into_io(self) -> StreamIo {
        StreamIo::new(self)
    }
}

// ============================================================================
// StreamConn - Read / Write
// ============================================================================

impl StreamConn {
    /// Reads bytes into `buf`.
    ///
    /// Waits for the next binary message only when no bytes of the previous
    /// one are left. Returns `Ok(0)` at end of stream or for an empty `buf`.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if a text message arrives
    /// - [`Error::ConnectionClosed`] if the connection was closed locally
    /// - [`Error::DeadlineExceeded`] if the read deadline elapsed
    /// - transport errors from the session unchanged
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return self.ensure_open().map(|()| 0);
        }

        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Reads up to `max` bytes without copying.
    ///
    /// Same semantics as [`read`](Self::read); an empty chunk means end of
    /// stream. A `max` of zero returns an empty chunk at once without
    /// waiting or consuming anything.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return self.ensure_open().map(|()| Bytes::new());
        }

        let id = self.id;
        self.guarded("read", &self.read_deadline, async {
            let mut half = self.reader.lock().await;
            half.next_chunk(max, id).await
        })
        .await
    }

    /// Sends all of `buf` as one binary message.
    ///
    /// Returns `buf.len()` on success; a message is never split or sent
    /// partially. A write interrupted after the message reached the session
    /// closes the connection, so the message is never delivered after an
    /// error was reported.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection was closed locally
    /// - [`Error::DeadlineExceeded`] if the write deadline elapsed
    /// - transport errors from the session unchanged
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.write_bytes(Bytes::copy_from_slice(buf)).await
    }

    /// Sends `data` as one binary message without copying.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_bytes(&self, data: Bytes) -> Result<usize> {
        if data.is_empty() {
            return self.ensure_open().map(|()| 0);
        }

        let len = data.len();
        self.guarded("write", &self.write_deadline, async {
            let mut writer = self.writer.lock().await;

            let in_flight = SendInFlight::arm(self);
            let sent = writer.send(Frame::Binary(data)).await;
            in_flight.disarm();
            sent?;

            trace!(conn_id = %self.id, len, "Binary message sent");
            Ok(len)
        })
        .await
    }
}

// ============================================================================
// StreamConn - Deadlines
// ============================================================================

impl StreamConn {
    /// Sets both the read and the write deadline. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Sets the read deadline. `None` clears it.
    ///
    /// Applies to reads already waiting as well as future ones.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.send_replace(deadline);
    }

    /// Sets the write deadline. `None` clears it.
    ///
    /// Applies to writes already waiting as well as future ones.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.write_deadline.send_replace(deadline);
    }
}

// ============================================================================
// StreamConn - Close
// ============================================================================

impl StreamConn {
    /// Closes the connection with a normal close frame.
    ///
    /// Reads and writes in flight fail with [`Error::ConnectionClosed`], as
    /// do all later ones. Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the close frame could not be sent.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseReason::normal()).await
    }

    /// Closes the connection with an explicit close code and reason.
    ///
    /// # Errors
    ///
    /// See [`close`](Self::close).
    pub async fn close_with(&self, reason: CloseReason) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        debug!(conn_id = %self.id, %reason, "Closing stream connection");

        let mut writer = self.writer.lock().await;
        if self.write_abandoned.load(Ordering::Acquire) {
            // Flushing now would deliver the interrupted message
            debug!(conn_id = %self.id, "Session dropped without close frame");
            return Ok(());
        }

        let shutdown = async {
            writer.send(Frame::Close(Some(reason))).await?;
            writer.close().await
        };

        match timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => Ok(()),
            // Peer got there first
            Ok(Err(e)) if e.is_closed() => Ok(()),
            Ok(Err(e)) => {
                warn!(conn_id = %self.id, error = %e, "Failed to send close frame");
                Err(e)
            }
            Err(_) => {
                warn!(conn_id = %self.id, "Timed out sending close frame");
                Err(Error::deadline_exceeded("close"))
            }
        }
    }
}

// ============================================================================
// StreamConn - Internals
// ============================================================================

impl StreamConn {
    /// Closes the connection after a send was cut short.
    fn abandon_writes(&self) {
        self.write_abandoned.store(true, Ordering::Release);
        if !self.closed.send_replace(true) {
            warn!(conn_id = %self.id, "Write interrupted mid-message, connection closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Runs `op` until it finishes, the deadline elapses or the connection
    /// is closed, whichever comes first.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        deadline: &watch::Sender<Option<Instant>>,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut deadline_rx = deadline.subscribe();
        let mut closed_rx = self.closed.subscribe();
        let mut op = std::pin::pin!(op);

        loop {
            if *closed_rx.borrow_and_update() {
                return Err(Error::ConnectionClosed);
            }

            let current = *deadline_rx.borrow_and_update();
            if let Some(at) = current
                && at <= Instant::now()
            {
                trace!(conn_id = %self.id, operation, "Deadline already elapsed");
                return Err(Error::deadline_exceeded(operation));
            }

            let expiry = async move {
                match current {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                changed = closed_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::ConnectionClosed);
                    }
                }

                result = &mut op => return result,

                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return op.await;
                    }
                }

                () = expiry => {
                    debug!(conn_id = %self.id, operation, "Deadline exceeded");
                    return Err(Error::deadline_exceeded(operation));
                }
            }
        }
    }
}

/// Abandons the connection if dropped while its send is still armed.
struct SendInFlight<'a> {
    conn: &'a StreamConn,
    armed: bool,
}

impl<'a> SendInFlight<'a> {
    fn arm(conn: &'a StreamConn) -> Self {
        Self { conn, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SendInFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.abandon_writes();
        }
    }
}

impl fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
