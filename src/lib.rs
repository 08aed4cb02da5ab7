//! WebSocket Stream Transport - byte-stream RPC over WebSocket.
//!
//! This library lets an RPC system that normally runs over raw TCP run over
//! WebSocket sessions instead, e.g. behind proxies that only pass HTTP.
//!
//! # Architecture
//!
//! The transport has a client side and a server side:
//!
//! - **Client**: [`ClientConnector`] dials a fixed WebSocket endpoint and
//!   returns a [`StreamConn`]
//! - **Server**: [`UpgradeAdmitter`] upgrades HTTP requests and admits the
//!   sessions into a bounded [`ConnectionQueue`] that the RPC server
//!   accepts from
//!
//! Key design principles:
//!
//! - Every write is one binary message; reads reassemble the byte stream
//! - Admission never blocks and never buffers beyond the queue capacity
//! - Reads and writes honor settable deadlines
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use ws_stream_transport::{
//!     ClientConnector, ConnectionQueue, Result, UpgradeAdmitter, UpgradeOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Server side: upgrade endpoint feeding a queue
//!     let listener = Arc::new(ConnectionQueue::new("/rpc", "ws", 16));
//!     let app = UpgradeAdmitter::new(Arc::clone(&listener), UpgradeOptions::new())
//!         .router("/rpc");
//!
//!     let tcp = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     tokio::spawn(async move {
//!         axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>()).await
//!     });
//!
//!     // Client side: dial through the connector
//!     let connector = ClientConnector::new("ws://127.0.0.1:8080/rpc", None, false);
//!     let client = connector.dial(CancellationToken::new(), "service:50051").await?;
//!     client.write(b"hello").await?;
//!
//!     let server = listener.accept().await?;
//!     let mut buf = [0u8; 5];
//!     let n = server.read(&mut buf).await?;
//!     println!("received {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Listener, connector and upgrade options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection identifiers |
//! | [`transport`] | Connections, queue, connector, upgrade handler |

// ============================================================================
// Modules
// ============================================================================

/// Listener, connector and upgrade options.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Connection identifiers for logs.
pub mod identifiers;

/// WebSocket stream transport.
///
/// Client connector, server upgrade handler and the connection types they
/// share.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{ConnectorOptions, ListenerOptions, UpgradeOptions};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::ConnectionId;

// Transport types
pub use transport::{
    AdmissionPermit, ClientConnector, CloseReason, ConnectionAddrs, ConnectionQueue, DialFn,
    Dialer, Frame, Listener, ListenerAddr, RejectReason, Rejected, StreamConn, StreamIo,
    UpgradeAdmitter,
};
