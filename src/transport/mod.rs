//! WebSocket stream transport.
//!
//! Carries a byte-stream RPC protocol over WebSocket sessions, on both
//! sides of the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌──────────────────┐
//! │  RPC client      │                              │  RPC server      │
//! │                  │         WebSocket            │                  │
//! │  ClientConnector │◄────────────────────────────►│  UpgradeAdmitter │
//! │  → StreamConn    │   binary message per write   │  → ConnectionQueue│
//! │                  │                              │  → StreamConn    │
//! └──────────────────┘                              └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `UpgradeAdmitter` - Upgrade an HTTP request, reserve a queue slot
//! 2. `ConnectionQueue::accept` - RPC server takes the admitted connection
//! 3. `ClientConnector::dial` - RPC client opens its side
//! 4. `StreamConn` - Read and write bytes, with optional deadlines
//! 5. `StreamConn::close` - Close frame, then the session is released
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Byte stream over a WebSocket session |
//! | `dialer` | Client-side connection factory |
//! | `frame` | Transport-neutral WebSocket frames |
//! | `io` | `tokio::io` adapter |
//! | `listener` | Bounded admission queue |
//! | `traits` | Listener and dialer abstractions |
//! | `upgrade` | axum upgrade handler |

// ============================================================================
// Submodules
// ============================================================================

/// Byte stream over a WebSocket session.
pub mod connection;

/// Client-side connection factory.
pub mod dialer;

/// Transport-neutral WebSocket frames.
pub mod frame;

/// `tokio::io` adapter for connections.
pub mod io;

/// Bounded admission queue with listener semantics.
pub mod listener;

/// Listener and dialer abstractions.
pub mod traits;

/// HTTP upgrade endpoint.
pub mod upgrade;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::StreamConn;
pub use dialer::{ClientConnector, DialFn};
pub use frame::{CloseReason, Frame};
pub use io::StreamIo;
pub use listener::{AdmissionPermit, ConnectionQueue, ListenerAddr, RejectReason, Rejected};
pub use traits::{Dialer, Listener};
pub use upgrade::{ConnectionAddrs, UpgradeAdmitter};
