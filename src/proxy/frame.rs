//! Frames: the unit of traffic pushed to the observability queues.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

use super::websocket::WsFrame;

/// Which way a chunk of traffic was travelling through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to origin.
    Inbound,
    /// Origin to client.
    Outbound,
}

impl Direction {
    /// Metric label for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol structure recovered from a frame's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// HTTP upgrade request or response head preceding WebSocket traffic.
    Handshake {
        /// Request or status line, without the trailing CRLF.
        start_line: String,
    },
    /// One WebSocket frame.
    WebSocket(WsFrame),
}

/// One unit of proxied traffic.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Direction the bytes were travelling.
    pub direction: Direction,
    /// Raw bytes exactly as they crossed the wire.
    pub payload: Bytes,
    /// Decoded structure, or `None` when the engine could not (or does not) decode.
    pub decoded: Option<Decoded>,
    /// When the frame was produced.
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Create an undecoded frame.
    pub fn raw(direction: Direction, payload: Bytes) -> Self {
        Self {
            direction,
            payload,
            decoded: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a frame carrying decoded structure.
    pub fn decoded(direction: Direction, payload: Bytes, decoded: Decoded) -> Self {
        Self {
            direction,
            payload,
            decoded: Some(decoded),
            timestamp: Utc::now(),
        }
    }

    /// Whether the engine recovered any structure from this frame.
    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }
}
