//! `tokio::io` adapter for [`StreamConn`].
//!
//! RPC frameworks built on tokio consume transports as
//! `AsyncRead + AsyncWrite`. [`StreamIo`] drives the async methods of a
//! shared [`StreamConn`] from the poll-based traits, keeping at most one
//! read, one write and one shutdown operation in flight.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;

use super::StreamConn;

// ============================================================================
// StreamIo
// ============================================================================

/// A [`StreamConn`] exposed as `tokio::io::AsyncRead + AsyncWrite`.
///
/// Created with [`StreamConn::into_io`]. The underlying connection stays
/// reachable through [`conn`](Self::conn), e.g. to set deadlines.
pub struct StreamIo {
    /// Shared connection.
    conn: Arc<StreamConn>,
    /// Bytes read but not yet handed out.
    leftover: Bytes,
    /// Read in flight.
    reading: Option<BoxFuture<'static, Result<Bytes>>>,
    /// Write in flight and the length of its message.
    writing: Option<(usize, BoxFuture<'static, Result<usize>>)>,
    /// Shutdown in flight.
    closing: Option<BoxFuture<'static, Result<()>>>,
}

impl StreamIo {
    pub(crate) fn new(conn: StreamConn) -> Self {
        Self {
            conn: Arc::new(conn),
            leftover: Bytes::new(),
            reading: None,
            writing: None,
            closing: None,
        }
    }

    /// Returns the underlying connection.
    #[inline]
    #[must_use]
    pub fn conn(&self) -> &Arc<StreamConn> {
        &self.conn
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some((_, write)) = self.writing.as_mut() {
            let result = ready!(write.as_mut().poll(cx));
            self.writing = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// AsyncRead
// ============================================================================

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.leftover.is_empty() {
            let read = this.reading.get_or_insert_with(|| {
                let conn = Arc::clone(&this.conn);
                let max = buf.remaining();
                Box::pin(async move { conn.read_chunk(max).await })
            });

            let result = ready!(read.as_mut().poll(cx));
            this.reading = None;
            this.leftover = result?;
        }

        let n = buf.remaining().min(this.leftover.len());
        buf.put_slice(&this.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// AsyncWrite
// ============================================================================

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // A pending write was started by an earlier call; its bytes are the
        // prefix of `buf` that gets reported as written
        let (len, write) = this.writing.get_or_insert_with(|| {
            let conn = Arc::clone(&this.conn);
            let data = Bytes::copy_from_slice(buf);
            (
                data.len(),
                Box::pin(async move { conn.write_bytes(data).await }),
            )
        });
        let len = *len;

        let result = ready!(write.as_mut().poll(cx));
        this.writing = None;
        Poll::Ready(
            result
                .map(|_| len.min(buf.len()))
                .map_err(io::Error::from),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Every write is flushed as part of sending its message
        self.get_mut().poll_pending_write(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;

        let close = this.closing.get_or_insert_with(|| {
            let conn = Arc::clone(&this.conn);
            Box::pin(async move { conn.close().await })
        });

        let result = ready!(close.as_mut().poll(cx));
        this.closing = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIo")
            .field("conn", &self.conn)
            .field("leftover", &self.leftover.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
