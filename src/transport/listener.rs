//! Bounded admission queue exposed as a listener.
//!
//! Upgraded connections have no OS socket to accept from. The
//! [`ConnectionQueue`] stands in for one: the upgrade handler admits
//! connections with a non-blocking call and the RPC server takes them out
//! with a blocking [`accept`](ConnectionQueue::accept).
//!
//! # Admission Rule
//!
//! A connection is admitted when
//!
//! ```text
//! queued + reserved < capacity + waiting_accepts
//! ```
//!
//! and dropped otherwise. Nothing is ever buffered beyond that bound. A
//! capacity of zero therefore admits only while an `accept` call is
//! already waiting.
//!
//! # Lifecycle
//!
//! ```text
//! ┌────────┐   close()   ┌────────┐
//! │  Open  │────────────►│ Closed │  accept() → ListenerClosed
//! └────────┘             └────────┘  admit    → Rejected(Closed)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream::unfold;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::ListenerOptions;
use crate::error::{Error, Result};

use super::{StreamConn, StreamIo};

// ============================================================================
// ListenerAddr
// ============================================================================

/// Descriptive listener address.
///
/// There is no OS socket behind a [`ConnectionQueue`]; this is a label
/// pair for logs and for RPC servers that report their listen address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerAddr {
    network: String,
    address: String,
}

impl ListenerAddr {
    /// Creates an address from a network label and an address string.
    #[must_use]
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    /// Returns the network label, e.g. `"ws"`.
    #[inline]
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Returns the address string.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

// ============================================================================
// Rejection
// ============================================================================

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// No free slot in the queue.
    Full,
    /// The listener is closed.
    Closed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("connection queue is full"),
            Self::Closed => f.write_str("listener closed"),
        }
    }
}

/// A refused connection, handed back to the caller for cleanup.
pub struct Rejected<C> {
    /// The connection that was not admitted.
    pub conn: C,
    /// Why it was refused.
    pub reason: RejectReason,
}

impl<C> Rejected<C> {
    /// Splits into the connection and the matching error.
    #[must_use]
    pub fn into_parts(self) -> (C, Error) {
        (self.conn, Error::admission_rejected(self.reason))
    }
}

impl<C> fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<C> From<Rejected<C>> for Error {
    fn from(rejected: Rejected<C>) -> Self {
        Error::admission_rejected(rejected.reason)
    }
}

// ============================================================================
// QueueState
// ============================================================================

/// Everything admitters and acceptors share, guarded by one lock.
struct QueueState<C> {
    /// Admitted connections in admission order.
    queue: VecDeque<C>,
    /// Configured capacity.
    capacity: usize,
    /// `accept` calls currently waiting.
    waiting: usize,
    /// Slots held by outstanding permits.
    reserved: usize,
    /// Terminal flag.
    closed: bool,
}

impl<C> QueueState<C> {
    fn check_room(&self) -> std::result::Result<(), RejectReason> {
        if self.closed {
            Err(RejectReason::Closed)
        } else if self.queue.len() + self.reserved < self.capacity + self.waiting {
            Ok(())
        } else {
            Err(RejectReason::Full)
        }
    }
}

// ============================================================================
// ConnectionQueue
// ============================================================================

/// Bounded FIFO of admitted connections with listener semantics.
///
/// Generic over the connection type; servers use the default
/// [`StreamConn`].
///
/// # Example
///
/// ```ignore
/// let listener = Arc::new(ConnectionQueue::new("/rpc", "ws", 16));
///
/// // Admission side (usually the upgrade handler)
/// if let Err(rejected) = listener.try_admit(conn) {
///     rejected.conn.close().await?;
/// }
///
/// // Server side
/// let conn = listener.accept().await?;
/// ```
pub struct ConnectionQueue<C = StreamConn> {
    /// Static descriptive address.
    addr: ListenerAddr,
    /// Shared state.
    state: Mutex<QueueState<C>>,
    /// Wakes waiting acceptors on admission and close.
    notify: Notify,
}

// ============================================================================
// ConnectionQueue - Constructors
// ============================================================================

impl<C> ConnectionQueue<C> {
    /// Creates an open queue.
    ///
    /// # Arguments
    ///
    /// * `address` - Descriptive listen address
    /// * `network` - Network label, e.g. `"ws"`
    /// * `capacity` - Connections that may wait for `accept` (zero is legal)
    #[must_use]
    pub fn new(address: impl Into<String>, network: impl Into<String>, capacity: usize) -> Self {
        let addr = ListenerAddr::new(network, address);
        debug!(%addr, network = addr.network(), capacity, "Connection queue created");

        Self {
            addr,
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                waiting: 0,
                reserved: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Creates an open queue from validated options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn from_options(options: &ListenerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::new(
            options.address.clone(),
            options.network.clone(),
            options.capacity,
        ))
    }
}

// ============================================================================
// ConnectionQueue - Accessors
// ============================================================================

impl<C> ConnectionQueue<C> {
    /// Returns the descriptive address.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> &ListenerAddr {
        &self.addr
    }

    /// Returns the configured capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Returns the number of queued connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns `true` if no connection is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Returns `true` once the queue is closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// ConnectionQueue - Admission
// ============================================================================

impl<C> ConnectionQueue<C> {
    /// Admits a connection without waiting.
    ///
    /// # Errors
    ///
    /// Hands the connection back inside [`Rejected`] if the queue is full or
    /// closed. The caller is responsible for closing it.
    pub fn try_admit(&self, conn: C) -> std::result::Result<(), Rejected<C>> {
        {
            let mut state = self.state.lock();
            if let Err(reason) = state.check_room() {
                drop(state);
                warn!(addr = %self.addr, %reason, "Admission rejected");
                return Err(Rejected { conn, reason });
            }
            state.queue.push_back(conn);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Reserves a slot for a connection that is still being set up.
    ///
    /// The slot counts against the capacity until the permit is used or
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the [`RejectReason`] if no slot is available.
    pub fn try_reserve(self: &Arc<Self>) -> std::result::Result<AdmissionPermit<C>, RejectReason> {
        {
            let mut state = self.state.lock();
            if let Err(reason) = state.check_room() {
                drop(state);
                warn!(addr = %self.addr, %reason, "Admission reservation rejected");
                return Err(reason);
            }
            state.reserved += 1;
        }

        Ok(AdmissionPermit {
            queue: Arc::clone(self),
            used: false,
        })
    }
}

// ============================================================================
// ConnectionQueue - Accept / Close
// ============================================================================

impl<C> ConnectionQueue<C> {
    /// Waits for the next admitted connection.
    ///
    /// Connections are returned in admission order. Ownership passes to the
    /// caller, who is responsible for closing the connection.
    ///
    /// Cancel safe: dropping the future never loses a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] once the queue is closed, including
    /// for calls that were already waiting.
    pub async fn accept(&self) -> Result<C> {
        let mut waiter = Waiter {
            queue: self,
            active: false,
        };

        loop {
            let notified = self.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    waiter.release(&mut state);
                    return Err(Error::ListenerClosed);
                }
                if let Some(conn) = state.queue.pop_front() {
                    waiter.release(&mut state);
                    return Ok(conn);
                }
                if !waiter.active {
                    state.waiting += 1;
                    waiter.active = true;
                }
            }

            notified.await;
        }
    }

    /// Closes the queue.
    ///
    /// Wakes every waiting `accept` call. Connections still queued are not
    /// closed; recover them with [`drain`](Self::drain). A second call is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` matches the listener contract.
    pub fn close(&self) -> Result<()> {
        let queued = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.queue.len()
        };

        self.notify.notify_waiters();
        info!(addr = %self.addr, queued, "Connection queue closed");
        Ok(())
    }

    /// Removes and returns all queued connections.
    #[must_use]
    pub fn drain(&self) -> Vec<C> {
        self.state.lock().queue.drain(..).collect()
    }
}

// ============================================================================
// ConnectionQueue - Incoming Stream
// ============================================================================

impl ConnectionQueue<StreamConn> {
    /// Turns the queue into a stream of `tokio::io` connections.
    ///
    /// Ends when the queue is closed. Suited to RPC servers that serve an
    /// incoming stream instead of calling `accept` themselves.
    pub fn incoming(self: Arc<Self>) -> impl Stream<Item = Result<StreamIo>> + Send + 'static {
        unfold(self, |queue| async move {
            match queue.accept().await {
                Ok(conn) => Some((Ok(conn.into_io()), queue)),
                Err(Error::ListenerClosed) => None,
                Err(e) => Some((Err(e), queue)),
            }
        })
    }
}

impl<C> fmt::Debug for ConnectionQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionQueue")
            .field("addr", &self.addr)
            .field("queued", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("waiting", &state.waiting)
            .field("reserved", &state.reserved)
            .field("closed", &state.closed)
            .finish()
    }
}

// ============================================================================
// Waiter
// ============================================================================

/// Registration of one waiting `accept` call.
///
/// Deregisters on drop so a cancelled accept no longer counts as waiting.
struct Waiter<'a, C> {
    queue: &'a ConnectionQueue<C>,
    active: bool,
}

impl<C> Waiter<'_, C> {
    fn release(&mut self, state: &mut QueueState<C>) {
        if self.active {
            state.waiting -= 1;
            self.active = false;
        }
    }
}

impl<C> Drop for Waiter<'_, C> {
    fn drop(&mut self) {
        if self.active {
            self.queue.state.lock().waiting -= 1;
        }
    }
}

// ============================================================================
// AdmissionPermit
// ============================================================================

/// A reserved admission slot.
///
/// Obtained from [`ConnectionQueue::try_reserve`]. Dropping an unused
/// permit frees the slot.
pub struct AdmissionPermit<C = StreamConn> {
    queue: Arc<ConnectionQueue<C>>,
    used: bool,
}

impl<C> AdmissionPermit<C> {
    /// Admits a connection into the reserved slot.
    ///
    /// # Errors
    ///
    /// Hands the connection back with [`RejectReason::Closed`] if the queue
    /// was closed after the reservation.
    pub fn admit(mut self, conn: C) -> std::result::Result<(), Rejected<C>> {
        self.used = true;
        {
            let mut state = self.queue.state.lock();
            state.reserved -= 1;
            if state.closed {
                return Err(Rejected {
                    conn,
                    reason: RejectReason::Closed,
                });
            }
            state.queue.push_back(conn);
        }

        self.queue.notify.notify_one();
        Ok(())
    }
}

impl<C> Drop for AdmissionPermit<C> {
    fn drop(&mut self) {
        if !self.used {
            self.queue.state.lock().reserved -= 1;
            debug!(addr = %self.queue.addr, "Admission reservation released");
        }
    }
}

impl<C> fmt::Debug for AdmissionPermit<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("addr", &self.queue.addr)
            .field("used", &self.used)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    use crate::transport::connection::testing::pair;

    #[test]
    fn test_addr_is_descriptive() {
        let queue: ConnectionQueue<u32> = ConnectionQueue::new("/grpc", "ws", 4);
        assert_eq!(queue.addr().network(), "ws");
        assert_eq!(queue.addr().address(), "/grpc");
        assert_eq!(queue.addr().to_string(), "/grpc");
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn test_from_options() {
        let options = ListenerOptions::new("/grpc", "ws").with_capacity(2);
        let queue: ConnectionQueue<u32> = ConnectionQueue::from_options(&options).unwrap();
        assert_eq!(queue.capacity(), 2);

        let bad = ListenerOptions::new("/grpc", "");
        assert!(ConnectionQueue::<u32>::from_options(&bad).is_err());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ConnectionQueue::new("/q", "ws", 3);
        queue.try_admit(1).unwrap();
        queue.try_admit(2).unwrap();
        queue.try_admit(3).unwrap();

        assert_eq!(queue.accept().await.unwrap(), 1);
        assert_eq!(queue.accept().await.unwrap(), 2);
        assert_eq!(queue.accept().await.unwrap(), 3);
    }

    #[test]
    fn test_full_queue_rejects_and_returns_conn() {
        let queue = ConnectionQueue::new("/q", "ws", 1);
        queue.try_admit("first").unwrap();

        let rejected = queue.try_admit("second").unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Full);
        assert_eq!(rejected.conn, "second");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_without_waiter_rejects() {
        let queue = ConnectionQueue::new("/q", "ws", 0);
        let rejected = queue.try_admit(7).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Full);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacity_with_waiting_accept() {
        let queue = ConnectionQueue::new("/q", "ws", 0);

        let mut accept = task::spawn(queue.accept());
        assert_pending!(accept.poll());

        // One waiting accept makes room for exactly one connection
        queue.try_admit(1).unwrap();
        assert_eq!(queue.try_admit(2).unwrap_err().reason, RejectReason::Full);

        assert!(accept.is_woken());
        assert_eq!(assert_ready!(accept.poll()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_accept_stops_counting() {
        let queue = ConnectionQueue::new("/q", "ws", 0);

        {
            let mut accept = task::spawn(queue.accept());
            assert_pending!(accept.poll());
        }

        assert_eq!(queue.try_admit(1).unwrap_err().reason, RejectReason::Full);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_accepts() {
        let queue = Arc::new(ConnectionQueue::<u32>::new("/q", "ws", 2));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            waiters.push(tokio::spawn(async move { queue.accept().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().unwrap();

        for waiter in waiters {
            let result = timeout(Duration::from_secs(1), waiter)
                .await
                .expect("accept should be woken")
                .unwrap();
            assert!(matches!(result, Err(Error::ListenerClosed)));
        }

        assert!(matches!(queue.accept().await, Err(Error::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_close_twice_and_admit_after_close() {
        let queue = ConnectionQueue::new("/q", "ws", 2);
        queue.try_admit(1).unwrap();

        assert!(queue.close().is_ok());
        assert!(queue.close().is_ok());
        assert!(queue.is_closed());

        assert_eq!(queue.try_admit(2).unwrap_err().reason, RejectReason::Closed);
        assert!(matches!(queue.accept().await, Err(Error::ListenerClosed)));

        // Queued connections stay recoverable
        assert_eq!(queue.drain(), vec![1]);
    }

    #[test]
    fn test_reservation_counts_against_capacity() {
        let queue = Arc::new(ConnectionQueue::new("/q", "ws", 1));

        let permit = queue.try_reserve().unwrap();
        assert_eq!(queue.try_reserve().unwrap_err(), RejectReason::Full);
        assert_eq!(queue.try_admit(9).unwrap_err().reason, RejectReason::Full);

        drop(permit);
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_permit_admit() {
        let queue = Arc::new(ConnectionQueue::new("/q", "ws", 1));

        let permit = queue.try_reserve().unwrap();
        permit.admit(5).unwrap();
        assert_eq!(queue.accept().await.unwrap(), 5);

        let permit = queue.try_reserve().unwrap();
        queue.close().unwrap();
        let rejected = permit.admit(6).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::Closed);
        assert_eq!(rejected.conn, 6);
    }

    #[tokio::test]
    async fn test_concurrent_admission_over_capacity() {
        const CAPACITY: usize = 3;

        let queue = Arc::new(ConnectionQueue::new("/q", "ws", CAPACITY));

        let mut peers = Vec::new();
        let mut admissions = Vec::new();
        for _ in 0..=CAPACITY {
            let (client, server) = pair().await;
            peers.push(client);

            let queue = Arc::clone(&queue);
            admissions.push(tokio::spawn(async move {
                match queue.try_admit(server) {
                    Ok(()) => true,
                    Err(rejected) => {
                        rejected.conn.close().await.unwrap();
                        false
                    }
                }
            }));
        }

        let mut admitted = 0;
        for admission in admissions {
            if admission.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, CAPACITY);
        assert_eq!(queue.len(), CAPACITY);

        // Exactly one peer observes the rejected connection closing
        let mut closed = 0;
        for peer in &peers {
            peer.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(50)));
            let mut buf = [0u8; 1];
            if let Ok(0) = peer.read(&mut buf).await {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);

        for _ in 0..CAPACITY {
            queue.accept().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_incoming_ends_on_close() {
        let queue = Arc::new(ConnectionQueue::new("/q", "ws", 2));
        let (_client, server) = pair().await;
        queue.try_admit(server).unwrap();

        let mut incoming = Box::pin(Arc::clone(&queue).incoming());
        assert!(incoming.next().await.unwrap().is_ok());

        queue.close().unwrap();
        assert!(incoming.next().await.is_none());
    }
}
