//! Transport-neutral WebSocket messages.
//!
//! Client sessions come from `tokio-tungstenite`, server sessions from
//! axum's upgrade extractor. Both are reduced here to one [`Frame`] type
//! and a pair of boxed halves, so [`StreamConn`](super::StreamConn) never
//! depends on which side created it.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::future::ready;
use std::pin::Pin;

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Receiving half of a session.
pub(crate) type SessionReader = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Sending half of a session.
pub(crate) type SessionWriter = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;

// ============================================================================
// CloseReason
// ============================================================================

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// RFC 6455 close code.
    pub code: u16,
    /// Human readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Server overloaded, client may retry later.
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Creates a close reason.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure without a reason.
    #[inline]
    #[must_use]
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    /// Endpoint going away.
    #[inline]
    #[must_use]
    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(Self::GOING_AWAY, reason)
    }

    /// Overload rejection.
    #[inline]
    #[must_use]
    pub fn try_again_later(reason: impl Into<String>) -> Self {
        Self::new(Self::TRY_AGAIN_LATER, reason)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One WebSocket message, independent of the implementation that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque stream payload.
    Binary(Bytes),
    /// UTF-8 text. Never valid stream payload.
    Text(String),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Close control frame.
    Close(Option<CloseReason>),
    /// Low-level frame surfaced by the implementation.
    Raw,
}

impl Frame {
    /// Short name of the message kind, for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Binary(_) => "binary",
            Self::Text(_) => "text",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close(_) => "close",
            Self::Raw => "raw",
        }
    }
}

// ============================================================================
// tokio-tungstenite Conversions
// ============================================================================

impl From<WsMessage> for Frame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Binary(data) => Self::Binary(data),
            WsMessage::Text(text) => Self::Text(text.as_str().to_owned()),
            WsMessage::Ping(data) => Self::Ping(data),
            WsMessage::Pong(data) => Self::Pong(data),
            WsMessage::Close(frame) => Self::Close(frame.map(|frame| {
                CloseReason::new(u16::from(frame.code), frame.reason.as_str())
            })),
            WsMessage::Frame(_) => Self::Raw,
        }
    }
}

impl TryFrom<Frame> for WsMessage {
    type Error = Error;

    fn try_from(frame: Frame) -> Result<Self> {
        Ok(match frame {
            Frame::Binary(data) => Self::Binary(data),
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close(reason) => Self::Close(reason.map(|reason| WsCloseFrame {
                code: reason.code.into(),
                reason: reason.reason.into(),
            })),
            Frame::Raw => return Err(Error::protocol("raw frames cannot be sent")),
        })
    }
}

// ============================================================================
// axum Conversions
// ============================================================================

impl From<AxumMessage> for Frame {
    fn from(message: AxumMessage) -> Self {
        match message {
            AxumMessage::Binary(data) => Self::Binary(Bytes::from(data)),
            AxumMessage::Text(text) => Self::Text(text),
            AxumMessage::Ping(data) => Self::Ping(Bytes::from(data)),
            AxumMessage::Pong(data) => Self::Pong(Bytes::from(data)),
            AxumMessage::Close(frame) => Self::Close(
                frame.map(|frame| CloseReason::new(frame.code, frame.reason.into_owned())),
            ),
        }
    }
}

impl TryFrom<Frame> for AxumMessage {
    type Error = Error;

    fn try_from(frame: Frame) -> Result<Self> {
        Ok(match frame {
            Frame::Binary(data) => Self::Binary(data.into()),
            Frame::Text(text) => Self::Text(text),
            Frame::Ping(data) => Self::Ping(data.into()),
            Frame::Pong(data) => Self::Pong(data.into()),
            Frame::Close(reason) => Self::Close(reason.map(|reason| AxumCloseFrame {
                code: reason.code,
                reason: Cow::Owned(reason.reason),
            })),
            Frame::Raw => return Err(Error::protocol("raw frames cannot be sent")),
        })
    }
}

// ============================================================================
// Session Splitting
// ============================================================================

/// Splits a `tokio-tungstenite` session into boxed halves.
pub(crate) fn split_tungstenite<S>(ws: WebSocketStream<S>) -> (SessionReader, SessionWriter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let reader = stream.map(|message| message.map(Frame::from).map_err(Error::from));
    let writer = sink.with(|frame: Frame| ready(WsMessage::try_from(frame)));

    (Box::pin(reader), Box::pin(writer))
}

/// Splits an axum server session into boxed halves.
pub(crate) fn split_axum(ws: WebSocket) -> (SessionReader, SessionWriter) {
    let (sink, stream) = ws.split();

    let reader = stream.map(|message| message.map(Frame::from).map_err(Error::from));
    let writer = sink.with(|frame: Frame| ready(AxumMessage::try_from(frame)));

    (Box::pin(reader), Box::pin(writer))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tungstenite_binary_roundtrip() {
        let frame = Frame::from(WsMessage::Binary(Bytes::from_static(b"\x01\x02")));
        assert_eq!(frame, Frame::Binary(Bytes::from_static(b"\x01\x02")));

        let message = WsMessage::try_from(frame).unwrap();
        assert!(message.is_binary());
    }

    #[test]
    fn test_tungstenite_close_reason() {
        let message = WsMessage::try_from(Frame::Close(Some(CloseReason::try_again_later(
            "connection queue is full",
        ))))
        .unwrap();

        match Frame::from(message) {
            Frame::Close(Some(reason)) => {
                assert_eq!(reason.code, CloseReason::TRY_AGAIN_LATER);
                assert_eq!(reason.reason, "connection queue is full");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_axum_text_is_text() {
        let frame = Frame::from(AxumMessage::Text("hello".into()));
        assert_eq!(frame.kind(), "text");
    }

    #[test]
    fn test_raw_cannot_be_sent() {
        assert!(WsMessage::try_from(Frame::Raw).is_err());
        assert!(AxumMessage::try_from(Frame::Raw).is_err());
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::normal().to_string(), "1000");
        assert_eq!(
            CloseReason::going_away("listener closed").to_string(),
            "1001 (listener closed)"
        );
    }
}
