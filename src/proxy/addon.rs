//! Protocol addons and their per-connection engines.
//!
//! An [`Addon`] is chosen at configuration time. Each accepted connection
//! asks the [`EngineFactory`] for fresh [`Engine`]s so that partial buffers
//! never leak between connections.
//!
//! # Example
//!
//! ```ignore
//! use tankbot::proxy::{Addon, Direction, EngineFactory};
//!
//! let factory = EngineFactory::new(vec![Addon::game_protocol()]);
//! let mut engines = factory.new_engines();
//! for frame in engines[0].on_bytes(Direction::Inbound, &chunk) {
//!     println!("{:?}", frame.decoded);
//! }
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::frame::{Direction, Frame};
use super::websocket::{self, WebSocketEngine};

/// Addon variants, as named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AddonKind {
    /// Raw passthrough, one undecoded frame per read.
    Generic,
    /// WebSocket framing decoder for the game protocol.
    GameProtocol,
}

/// A configured protocol decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addon {
    /// Identity decoder.
    Generic,
    /// WebSocket framing decoder.
    GameProtocol {
        /// Largest payload accepted before the stream is treated as malformed.
        max_payload: usize,
    },
}

impl Addon {
    /// Game protocol decoder with the default payload limit.
    pub fn game_protocol() -> Self {
        Addon::GameProtocol {
            max_payload: websocket::DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Build an addon from its configured kind.
    pub fn from_kind(kind: AddonKind, max_payload: usize) -> Self {
        match kind {
            AddonKind::Generic => Addon::Generic,
            AddonKind::GameProtocol => Addon::GameProtocol { max_payload },
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Addon::Generic => "generic",
            Addon::GameProtocol { .. } => "game_protocol",
        }
    }

    /// Fresh connection-scoped decoding state.
    pub fn new_engine(&self) -> Engine {
        match self {
            Addon::Generic => Engine::Generic(GenericEngine),
            Addon::GameProtocol { max_payload } => {
                Engine::GameProtocol(WebSocketEngine::new(*max_payload))
            }
        }
    }
}

/// Per-connection decoder.
#[derive(Debug)]
pub enum Engine {
    /// See [`GenericEngine`].
    Generic(GenericEngine),
    /// See [`WebSocketEngine`].
    GameProtocol(WebSocketEngine),
}

impl Engine {
    /// Feed a chunk read in `direction` and iterate over the resulting frames.
    ///
    /// Never fails; undecodable input comes back as frames with
    /// `decoded == None`.
    pub fn on_bytes(&mut self, direction: Direction, bytes: &[u8]) -> Frames<'_> {
        match self {
            Engine::Generic(engine) => Frames::Generic(engine.on_bytes(direction, bytes)),
            Engine::GameProtocol(engine) => Frames::GameProtocol(engine.on_bytes(direction, bytes)),
        }
    }
}

/// Identity engine: every non-empty chunk becomes exactly one raw frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericEngine;

impl GenericEngine {
    fn on_bytes(&mut self, direction: Direction, bytes: &[u8]) -> Option<Frame> {
        (!bytes.is_empty()).then(|| Frame::raw(direction, Bytes::copy_from_slice(bytes)))
    }
}

/// Frames produced by one [`Engine::on_bytes`] call.
#[derive(Debug)]
pub enum Frames<'a> {
    /// At most one raw frame.
    Generic(Option<Frame>),
    /// Lazily decoded WebSocket frames.
    GameProtocol(websocket::Decode<'a>),
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        match self {
            Frames::Generic(frame) => frame.take(),
            Frames::GameProtocol(decode) => decode.next(),
        }
    }
}

/// Builds the engines for each accepted connection from the ordered addon list.
#[derive(Debug, Clone)]
pub struct EngineFactory {
    addons: Vec<Addon>,
}

impl EngineFactory {
    /// Create a factory for `addons`, applied in order.
    pub fn new(addons: Vec<Addon>) -> Self {
        Self { addons }
    }

    /// Configured addons.
    pub fn addons(&self) -> &[Addon] {
        &self.addons
    }

    /// One fresh engine per addon, in configuration order.
    pub fn new_engines(&self) -> Vec<Engine> {
        self.addons.iter().map(Addon::new_engine).collect()
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::new(vec![Addon::game_protocol()])
    }
}
