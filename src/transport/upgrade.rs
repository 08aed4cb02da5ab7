//! HTTP upgrade endpoint feeding a [`ConnectionQueue`].
//!
//! [`UpgradeAdmitter`] is an axum handler: it upgrades the request to a
//! WebSocket, wraps the session as a [`StreamConn`] and admits it into the
//! queue an RPC server accepts from.
//!
//! # Admission Flow
//!
//! ```text
//! request ──► negotiate upgrade ──✗──► 500 "ws upgrade error: …"
//!                   │
//!                   ▼
//!             reserve slot ──────✗──► 503 "connection queue is full"
//!                   │
//!                   ▼
//!          101 Switching Protocols
//!                   │
//!                   ▼
//!      StreamConn ──► permit.admit ──✗──► close frame 1001/1013
//!                   │
//!                   ▼
//!           ConnectionQueue::accept
//! ```
//!
//! The slot is reserved before answering, so an overloaded server still
//! replies with a real `503` the client can see, and an upgraded session
//! is never left open outside the queue.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::connect_info::Connected;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::serve::IncomingStream;
use tracing::{debug, info, warn};

use crate::config::UpgradeOptions;
use crate::error::Result;

use super::frame::CloseReason;
use super::listener::{ConnectionQueue, RejectReason};
use super::StreamConn;

// ============================================================================
// ConnectionAddrs
// ============================================================================

/// Both socket addresses of an accepted HTTP connection.
///
/// Serve the router with
/// `into_make_service_with_connect_info::<ConnectionAddrs>()` to record the
/// local as well as the peer address on admitted connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionAddrs {
    /// Address the server accepted on.
    pub local: Option<SocketAddr>,
    /// Address of the client.
    pub peer: Option<SocketAddr>,
}

impl Connected<IncomingStream<'_>> for ConnectionAddrs {
    fn connect_info(target: IncomingStream<'_>) -> Self {
        Self {
            local: target.local_addr().ok(),
            peer: Some(target.remote_addr()),
        }
    }
}

// ============================================================================
// UpgradeAdmitter
// ============================================================================

/// Upgrade handler bound to one queue and one upgrade configuration.
///
/// # Example
///
/// ```ignore
/// let listener = Arc::new(ConnectionQueue::new("/rpc", "ws", 16));
/// let app = UpgradeAdmitter::new(Arc::clone(&listener), UpgradeOptions::new())
///     .router("/rpc");
///
/// tokio::spawn(axum::serve(tcp, app.into_make_service_with_connect_info::<ConnectionAddrs>()));
///
/// while let Ok(conn) = listener.accept().await {
///     tokio::spawn(serve_rpc(conn));
/// }
/// ```
#[derive(Clone)]
pub struct UpgradeAdmitter {
    queue: Arc<ConnectionQueue<StreamConn>>,
    options: Arc<UpgradeOptions>,
}

impl UpgradeAdmitter {
    /// Creates an admitter.
    #[must_use]
    pub fn new(queue: Arc<ConnectionQueue<StreamConn>>, options: UpgradeOptions) -> Self {
        Self {
            queue,
            options: Arc::new(options),
        }
    }

    /// Creates an admitter after validating `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the options are invalid.
    pub fn try_new(queue: Arc<ConnectionQueue<StreamConn>>, options: UpgradeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::new(queue, options))
    }

    /// Returns the queue connections are admitted into.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<ConnectionQueue<StreamConn>> {
        &self.queue
    }

    /// Returns the upgrade options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &UpgradeOptions {
        &self.options
    }

    /// Builds a router serving the admitter at `path`.
    ///
    /// Serve it with `into_make_service_with_connect_info::<ConnectionAddrs>()`
    /// to record both socket addresses on admitted connections, or with
    /// `::<SocketAddr>()` for the peer address only.
    #[must_use]
    pub fn router(self, path: &str) -> Router {
        Router::new().route(path, get(admit)).with_state(self)
    }
}

// ============================================================================
// UpgradeAdmitter - Request Handling
// ============================================================================

impl UpgradeAdmitter {
    /// Handles one upgrade request.
    ///
    /// Usable directly from custom axum handlers; [`admit`] is the ready-made
    /// one.
    pub fn handle(
        &self,
        upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
        headers: &HeaderMap,
        addrs: ConnectionAddrs,
    ) -> Response {
        let ConnectionAddrs { local, peer } = addrs;

        let upgrade = match upgrade {
            Ok(upgrade) => upgrade,
            Err(rejection) => return upgrade_error(peer, &rejection.body_text()),
        };

        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        if !self.options.origin_allowed(origin) {
            return upgrade_error(peer, &format!("origin {origin:?} not allowed"));
        }

        let permit = match self.queue.try_reserve() {
            Ok(permit) => permit,
            Err(reason) => {
                warn!(?peer, %reason, addr = %self.queue.addr(), "Upgrade refused");
                return (StatusCode::SERVICE_UNAVAILABLE, reason.to_string()).into_response();
            }
        };

        self.configure(upgrade)
            .on_failed_upgrade(move |e| {
                warn!(?peer, error = %e, "WebSocket upgrade failed after handshake");
            })
            .on_upgrade(move |socket| async move {
                let conn = StreamConn::from_axum(socket, peer).with_local_addr(local);
                let conn_id = conn.id();

                match permit.admit(conn) {
                    Ok(()) => info!(%conn_id, ?peer, "Connection admitted"),
                    Err(rejected) => {
                        let reason = rejected.reason;
                        warn!(%conn_id, ?peer, %reason, "Upgraded connection dropped");
                        if let Err(e) = rejected.conn.close_with(close_reason(reason)).await {
                            debug!(%conn_id, error = %e, "Close after rejection failed");
                        }
                    }
                }
            })
    }

    /// Admits an already upgraded connection without waiting.
    ///
    /// For HTTP stacks that perform the upgrade themselves. A refused
    /// connection is closed with a close frame before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionRejected`](crate::Error::AdmissionRejected) if the queue is full or closed.
    pub async fn admit_conn(&self, conn: StreamConn) -> Result<()> {
        let conn_id = conn.id();

        match self.queue.try_admit(conn) {
            Ok(()) => {
                info!(%conn_id, "Connection admitted");
                Ok(())
            }
            Err(rejected) => {
                let reason = rejected.reason;
                let (conn, err) = rejected.into_parts();
                if let Err(e) = conn.close_with(close_reason(reason)).await {
                    debug!(%conn_id, error = %e, "Close after rejection failed");
                }
                Err(err)
            }
        }
    }

    /// Applies the upgrade options.
    fn configure(&self, mut upgrade: WebSocketUpgrade) -> WebSocketUpgrade {
        let options = &self.options;

        if let Some(size) = options.write_buffer_size {
            upgrade = upgrade.write_buffer_size(size);
        }
        if let Some(size) = options.max_write_buffer_size {
            upgrade = upgrade.max_write_buffer_size(size);
        }
        if let Some(size) = options.max_message_size {
            upgrade = upgrade.max_message_size(size);
        }
        if let Some(size) = options.max_frame_size {
            upgrade = upgrade.max_frame_size(size);
        }
        if !options.protocols.is_empty() {
            upgrade = upgrade.protocols(options.protocols.clone());
        }

        upgrade
    }
}

impl fmt::Debug for UpgradeAdmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeAdmitter")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Handler
// ============================================================================

/// axum handler admitting upgraded connections into the state's queue.
pub async fn admit(
    State(admitter): State<UpgradeAdmitter>,
    addrs: Option<ConnectInfo<ConnectionAddrs>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let addrs = match (addrs, peer) {
        (Some(ConnectInfo(addrs)), _) => addrs,
        (None, peer) => ConnectionAddrs {
            local: None,
            peer: peer.map(|ConnectInfo(addr)| addr),
        },
    };
    admitter.handle(upgrade, &headers, addrs)
}

// ============================================================================
// Helpers
// ============================================================================

/// Close frame sent to a peer whose upgraded connection was not admitted.
fn close_reason(reason: RejectReason) -> CloseReason {
    match reason {
        RejectReason::Full => CloseReason::try_again_later(reason.to_string()),
        RejectReason::Closed => CloseReason::going_away(reason.to_string()),
    }
}

/// Response for a failed upgrade negotiation.
fn upgrade_error(peer: Option<SocketAddr>, reason: &str) -> Response {
    warn!(?peer, reason, "WebSocket upgrade rejected");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("ws upgrade error: {reason}"),
    )
        .into_response()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_util::sync::CancellationToken;

    use crate::error::Error;
    use crate::transport::ClientConnector;
    use crate::transport::connection::testing::pair;

    /// Serves the admitter on a random loopback port.
    async fn serve(admitter: UpgradeAdmitter) -> String {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let app = admitter.router("/rpc");

        tokio::spawn(async move {
            axum::serve(tcp, app.into_make_service_with_connect_info::<ConnectionAddrs>())
                .await
                .unwrap();
        });

        format!("ws://{addr}/rpc")
    }

    fn admitter(capacity: usize, options: UpgradeOptions) -> UpgradeAdmitter {
        let queue = Arc::new(ConnectionQueue::new("/rpc", "ws", capacity));
        UpgradeAdmitter::new(queue, options)
    }

    fn http_status(err: WsError) -> u16 {
        match err {
            WsError::Http(response) => response.status().as_u16(),
            other => panic!("expected HTTP error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_dial_admit_accept_and_reassemble() {
        let admitter = admitter(4, UpgradeOptions::new());
        let queue = Arc::clone(admitter.queue());
        let url = serve(admitter).await;

        let client = ClientConnector::new(url, None, false)
            .dial(CancellationToken::new(), "X")
            .await
            .unwrap();
        let server = queue.accept().await.unwrap();
        assert!(server.peer_addr().is_some());
        assert_eq!(server.peer_addr(), client.local_addr());
        assert_eq!(server.local_addr(), client.peer_addr());

        client.write(&[0x01, 0x02, 0x03]).await.unwrap();
        client.write(&[0x04]).await.unwrap();

        let mut received = Vec::new();
        let mut small = [0u8; 2];
        for _ in 0..2 {
            let n = server.read(&mut small).await.unwrap();
            received.extend_from_slice(&small[..n]);
        }
        let mut large = [0u8; 4];
        let n = server.read(&mut large).await.unwrap();
        received.extend_from_slice(&large[..n]);

        assert_eq!(received, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn test_zero_capacity_without_accept_is_unavailable() {
        let admitter = admitter(0, UpgradeOptions::new());
        let queue = Arc::clone(admitter.queue());
        let url = serve(admitter).await;

        let err = connect_async(url).await.unwrap_err();
        assert_eq!(http_status(err), 503);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacity_with_waiting_accept() {
        let admitter = admitter(0, UpgradeOptions::new());
        let queue = Arc::clone(admitter.queue());
        let url = serve(admitter).await;

        let accept = tokio::spawn(async move { queue.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = ClientConnector::new(url, None, false)
            .dial(CancellationToken::new(), "ignored")
            .await
            .unwrap();
        let server = tokio::time::timeout(Duration::from_secs(2), accept)
            .await
            .expect("accept should complete")
            .unwrap()
            .unwrap();

        client.write(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(server.read(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_is_unavailable() {
        let admitter = admitter(1, UpgradeOptions::new());
        let queue = Arc::clone(admitter.queue());
        let url = serve(admitter).await;

        let _first = connect_async(url.as_str()).await.unwrap();
        let err = connect_async(url.as_str()).await.unwrap_err();
        assert_eq!(http_status(err), 503);

        // The first connection is admitted once its upgrade completes
        let conn = tokio::time::timeout(Duration::from_secs(2), queue.accept())
            .await
            .expect("first connection should be queued")
            .unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_listener_is_unavailable() {
        let admitter = admitter(4, UpgradeOptions::new());
        admitter.queue().close().unwrap();
        let url = serve(admitter).await;

        let err = connect_async(url).await.unwrap_err();
        assert_eq!(http_status(err), 503);
    }

    #[tokio::test]
    async fn test_plain_request_is_upgrade_error() {
        let admitter = admitter(4, UpgradeOptions::new());
        let queue = Arc::clone(admitter.queue());
        let url = serve(admitter).await;
        let host = url.trim_start_matches("ws://").trim_end_matches("/rpc");

        let mut stream = TcpStream::connect(host).await.unwrap();
        stream
            .write_all(
                format!("GET /rpc HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 500"), "{response}");
        assert!(response.contains("ws upgrade error"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_origin_is_upgrade_error() {
        let options = UpgradeOptions::new().with_allowed_origin("https://app.example.com");
        let url = serve(admitter(4, options)).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_static("https://evil.test"));

        let err = connect_async(request).await.unwrap_err();
        assert_eq!(http_status(err), 500);
    }

    #[tokio::test]
    async fn test_admit_conn_closes_rejected() {
        let admitter = admitter(0, UpgradeOptions::new());
        let (client, server) = pair().await;

        let err = admitter.admit_conn(server).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AdmissionRejected {
                reason: RejectReason::Full
            }
        ));

        // Peer sees the close frame as end of stream
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_close_reasons() {
        assert_eq!(
            close_reason(RejectReason::Full).code,
            CloseReason::TRY_AGAIN_LATER
        );
        assert_eq!(close_reason(RejectReason::Closed).code, CloseReason::GOING_AWAY);
    }
}
