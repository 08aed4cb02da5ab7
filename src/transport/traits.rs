//! Listener and dialer abstractions.
//!
//! RPC servers and clients are written against these traits rather than
//! against the concrete queue or connector, so the WebSocket transport can
//! stand in wherever a socket listener or TCP dialer was used.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::StreamConn;
use super::dialer::ClientConnector;
use super::listener::{ConnectionQueue, ListenerAddr};

// ============================================================================
// Listener
// ============================================================================

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Connection type handed out by [`accept`](Self::accept).
    type Conn: Send;

    /// Waits for the next inbound connection.
    async fn accept(&self) -> Result<Self::Conn>;

    /// Stops accepting; waiting and future `accept` calls fail.
    fn close(&self) -> Result<()>;

    /// Returns the listen address.
    fn addr(&self) -> &ListenerAddr;
}

#[async_trait]
impl<C: Send> Listener for ConnectionQueue<C> {
    type Conn = C;

    async fn accept(&self) -> Result<C> {
        ConnectionQueue::accept(self).await
    }

    fn close(&self) -> Result<()> {
        ConnectionQueue::close(self)
    }

    fn addr(&self) -> &ListenerAddr {
        ConnectionQueue::addr(self)
    }
}

// ============================================================================
// Dialer
// ============================================================================

/// Source of outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connection type returned by [`dial`](Self::dial).
    type Conn: Send;

    /// Opens a connection for the logical address `addr`.
    async fn dial(&self, cancel: CancellationToken, addr: &str) -> Result<Self::Conn>;
}

#[async_trait]
impl Dialer for ClientConnector {
    type Conn = StreamConn;

    async fn dial(&self, cancel: CancellationToken, addr: &str) -> Result<StreamConn> {
        ClientConnector::dial(self, cancel, addr).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::error::Error;

    async fn accept_one<L: Listener>(listener: &L) -> Result<L::Conn> {
        listener.accept().await
    }

    #[tokio::test]
    async fn test_queue_as_listener() {
        let queue = Arc::new(ConnectionQueue::new("/rpc", "ws", 1));
        queue.try_admit(11u32).unwrap();

        assert_eq!(accept_one(queue.as_ref()).await.unwrap(), 11);
        assert_eq!(Listener::addr(queue.as_ref()).network(), "ws");

        Listener::close(queue.as_ref()).unwrap();
        assert!(matches!(
            accept_one(queue.as_ref()).await,
            Err(Error::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_connector_as_dialer() {
        let connector: Box<dyn Dialer<Conn = StreamConn>> =
            Box::new(ClientConnector::new("ws://127.0.0.1:1", None, false));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            connector.dial(cancel, "ignored").await,
            Err(Error::Cancelled)
        ));
    }
}
