//! Client-side connection factory.
//!
//! RPC clients open transports through a callback shaped like
//! `(cancellation, address) -> connection`. [`ClientConnector`] fixes the
//! real WebSocket endpoint at construction time, ignores the logical
//! address the RPC client passes in, and returns a [`StreamConn`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::Connector;
use tokio_tungstenite::client_async_tls_with_config;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ConnectorOptions;
use crate::error::{Error, Result};

use super::StreamConn;

// ============================================================================
// Types
// ============================================================================

/// Connection factory handed to RPC clients.
///
/// Takes the caller's cancellation token and the (ignored) logical
/// address.
pub type DialFn =
    Arc<dyn Fn(CancellationToken, String) -> BoxFuture<'static, Result<StreamConn>> + Send + Sync>;

// ============================================================================
// ClientConnector
// ============================================================================

/// Dials a fixed WebSocket endpoint and wraps sessions as [`StreamConn`].
///
/// Cheap to clone; clones share the same options.
///
/// # Example
///
/// ```ignore
/// let connector = ClientConnector::new("ws://127.0.0.1:8080/rpc", None, false);
/// let dial = connector.dialer();
///
/// // Handed to the RPC client as its connection factory
/// let conn = dial(CancellationToken::new(), "service.local:443".into()).await?;
/// ```
#[derive(Clone)]
pub struct ClientConnector {
    options: Arc<ConnectorOptions>,
}

impl ClientConnector {
    /// Creates a connector for `url`.
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket endpoint (`ws://` or `wss://`)
    /// * `headers` - Extra headers for the upgrade request
    /// * `insecure` - Skip certificate verification for `wss://`
    #[must_use]
    pub fn new(url: impl Into<String>, headers: Option<HeaderMap>, insecure: bool) -> Self {
        let options = ConnectorOptions::new(url)
            .with_headers(headers.unwrap_or_default())
            .with_insecure(insecure);

        Self {
            options: Arc::new(options),
        }
    }

    /// Creates a connector from validated options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn with_options(options: ConnectorOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
        })
    }

    /// Returns the connector options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    /// Returns the configured endpoint.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.options.url
    }

    /// Dials the configured endpoint.
    ///
    /// `addr` is the logical address the RPC client asked for; it is only
    /// logged.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fires before the handshake completes
    /// - [`Error::ConnectionTimeout`] if the configured connect timeout elapses
    /// - [`Error::WebSocket`] with the dial error unchanged
    /// - [`Error::Tls`] if the insecure TLS connector cannot be built
    pub async fn dial(&self, cancel: CancellationToken, addr: &str) -> Result<StreamConn> {
        trace!(addr, url = %self.options.url, "Dial requested");

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(url = %self.options.url, "Dial cancelled");
                Err(Error::Cancelled)
            }

            result = self.handshake() => result,
        }
    }

    /// Returns the connection factory for RPC clients.
    #[must_use]
    pub fn dialer(&self) -> DialFn {
        let connector = self.clone();
        Arc::new(
            move |cancel: CancellationToken, addr: String| -> BoxFuture<'static, Result<StreamConn>> {
                let connector = connector.clone();
                Box::pin(async move { connector.dial(cancel, &addr).await })
            },
        )
    }

    /// Performs the WebSocket handshake.
    async fn handshake(&self) -> Result<StreamConn> {
        let options = &self.options;

        let mut request = options.url.as_str().into_client_request()?;
        request.headers_mut().extend(options.headers.clone());

        let tls = if options.insecure && options.is_tls() {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            Some(Connector::NativeTls(connector))
        } else {
            None
        };

        let host = request
            .uri()
            .host()
            .ok_or(WsError::Url(UrlError::NoHostName))?
            .to_string();
        let port = request
            .uri()
            .port_u16()
            .unwrap_or(if options.is_tls() { 443 } else { 80 });
        let config = options.websocket_config();

        let connect = async move {
            let tcp = TcpStream::connect(format!("{host}:{port}"))
                .await
                .map_err(WsError::Io)?;
            let local = tcp.local_addr().ok();
            let peer = tcp.peer_addr().ok();

            let (ws, response) = client_async_tls_with_config(request, tcp, Some(config), tls).await?;
            Ok::<_, Error>((ws, response, local, peer))
        };

        let (ws, response, local, peer) = match options.connect_timeout {
            Some(limit) => timeout(limit, connect).await.map_err(|_| {
                Error::connection_timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
            })??,
            None => connect.await?,
        };

        let conn = StreamConn::from_tungstenite(ws, peer).with_local_addr(local);
        info!(
            conn_id = %conn.id(),
            url = %options.url,
            ?local,
            ?peer,
            status = %response.status(),
            "WebSocket connection established"
        );

        Ok(conn)
    }
}

impl fmt::Debug for ClientConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnector")
            .field("url", &self.options.url)
            .field("insecure", &self.options.insecure)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
