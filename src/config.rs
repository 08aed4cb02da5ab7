//! Listener, connector and upgrade configuration.
//!
//! Plain option structs with fluent `with_*` builders. All of them are
//! `serde`-enabled so host applications can embed them in their own
//! configuration files.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ws_stream_transport::config::{ConnectorOptions, ListenerOptions, UpgradeOptions};
//!
//! let listener = ListenerOptions::new("/rpc", "ws").with_capacity(64);
//! let upgrade = UpgradeOptions::new()
//!     .with_max_message_size(4 << 20)
//!     .with_allowed_origin("https://app.example.com");
//! let connector = ConnectorOptions::new("wss://rpc.example.com/rpc")
//!     .with_connect_timeout(Duration::from_secs(10));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default admission queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default network label reported by listeners.
pub const DEFAULT_NETWORK: &str = "ws";

// ============================================================================
// ListenerOptions
// ============================================================================

/// Configuration of a [`ConnectionQueue`](crate::ConnectionQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    /// Descriptive listen address (typically the HTTP route).
    pub address: String,

    /// Network label, e.g. `"ws"`.
    pub network: String,

    /// Number of admitted connections that may wait for `accept`.
    ///
    /// Zero is legal: admission then only succeeds while an `accept`
    /// call is already waiting.
    pub capacity: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            network: DEFAULT_NETWORK.to_string(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ListenerOptions {
    /// Creates listener options with the default capacity.
    #[must_use]
    pub fn new(address: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            network: network.into(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the queue capacity.
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the network label is empty.
    pub fn validate(&self) -> Result<()> {
        if self.network.trim().is_empty() {
            return Err(Error::config("Listener network label must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// ConnectorOptions
// ============================================================================

/// Configuration of a [`ClientConnector`](crate::ClientConnector).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,

    /// Extra headers sent with the upgrade request.
    #[serde(skip)]
    pub headers: HeaderMap,

    /// Skip certificate and hostname verification for `wss://`.
    pub insecure: bool,

    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Option<Duration>,

    /// Largest incoming message accepted by the client session.
    pub max_message_size: Option<usize>,
}

impl ConnectorOptions {
    /// Creates connector options for the given endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Replaces the handshake headers.
    #[inline]
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Enables or disables certificate verification bypass.
    #[inline]
    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the maximum incoming message size.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL does not parse or its scheme
    /// is not `ws`/`wss`.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::config(format!("Invalid WebSocket URL {:?}: {e}", self.url)))?;

        match url.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(Error::config(format!(
                "Unsupported URL scheme {other:?}, expected ws or wss"
            ))),
        }
    }

    /// Returns `true` if the endpoint uses TLS.
    #[inline]
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.url.starts_with("wss://")
    }

    /// Builds the client session configuration.
    #[must_use]
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.max_message_size.is_some() {
            config.max_message_size = self.max_message_size;
        }
        config
    }
}

// ============================================================================
// UpgradeOptions
// ============================================================================

/// Configuration applied to every server-side upgrade.
///
/// Buffer and size limits are passed through to the WebSocket
/// implementation unchanged; `None` keeps its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeOptions {
    /// Target size of the outgoing write buffer.
    pub write_buffer_size: Option<usize>,

    /// Hard limit on the outgoing write buffer.
    pub max_write_buffer_size: Option<usize>,

    /// Largest incoming message.
    pub max_message_size: Option<usize>,

    /// Largest incoming frame.
    pub max_frame_size: Option<usize>,

    /// Subprotocols offered during negotiation.
    pub protocols: Vec<String>,

    /// Origins allowed to upgrade. Empty allows every origin.
    pub allowed_origins: Vec<String>,
}

impl UpgradeOptions {
    /// Creates upgrade options with transport defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            write_buffer_size: None,
            max_write_buffer_size: None,
            max_message_size: None,
            max_frame_size: None,
            protocols: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }

    /// Sets the write buffer size.
    #[inline]
    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = Some(size);
        self
    }

    /// Sets the maximum write buffer size.
    #[inline]
    #[must_use]
    pub fn with_max_write_buffer_size(mut self, size: usize) -> Self {
        self.max_write_buffer_size = Some(size);
        self
    }

    /// Sets the maximum incoming message size.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Sets the maximum incoming frame size.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Adds a supported subprotocol.
    #[inline]
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Adds an allowed origin.
    #[inline]
    #[must_use]
    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Returns `true` if a request carrying `origin` may upgrade.
    ///
    /// Requests without an `Origin` header are non-browser clients and
    /// are always allowed.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed_origins.is_empty() => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin)),
        }
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a size limit is zero, the write buffer
    /// limit does not exceed the write buffer size, or the frame limit
    /// exceeds the message limit.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("write_buffer_size", self.write_buffer_size),
            ("max_write_buffer_size", self.max_write_buffer_size),
            ("max_message_size", self.max_message_size),
            ("max_frame_size", self.max_frame_size),
        ];
        for (name, size) in sizes {
            if size == Some(0) {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        if let (Some(buffer), Some(limit)) = (self.write_buffer_size, self.max_write_buffer_size)
            && limit <= buffer
        {
            return Err(Error::config(
                "max_write_buffer_size must exceed write_buffer_size",
            ));
        }

        if let (Some(frame), Some(message)) = (self.max_frame_size, self.max_message_size)
            && frame > message
        {
            return Err(Error::config(
                "max_frame_size must not exceed max_message_size",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
