//! Intercepting proxy with WebSocket game-protocol decoding.
//!
//! This module provides an HTTP proxy with:
//! - HTTP CONNECT tunnelling, with TLS termination on configured ports
//! - A persistent interception CA and per-host leaf certificates
//! - Per-connection protocol engines built from an ordered addon list
//! - Bounded, drop-counting frame queues for the observability reader
//! - Port negotiation with a one-port fallback
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  CONNECT   ┌────────────────────────────────┐        ┌────────┐
//!  │ browser  │──────────▶│ ProxyService (127.0.0.1:9000)   │──────▶│ origin │
//!  └──────────┘            │  relay ─▶ engines ─▶ FrameSink  │        └────────┘
//!                          └──────────────────┬─────────────┘
//!                                             ▼
//!                              inbound / outbound FrameQueue
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tankbot::proxy::{ProxyConfig, ProxyService};
//! use tankbot::telemetry::NullReporter;
//!
//! let service = ProxyService::new(ProxyConfig::default(), Arc::new(NullReporter));
//! let port = service.start().await?;
//! while let Some(frame) = service.inbound().recv().await {
//!     println!("{} bytes from the client", frame.payload.len());
//! }
//! service.stop().await;
//! ```

pub mod addon;
pub mod ca;
pub mod connect;
pub mod error;
pub mod frame;
pub mod ports;
pub mod queue;
pub mod relay;
pub(crate) mod server;
pub mod service;
pub mod tls;
pub mod websocket;

pub use addon::{Addon, AddonKind, Engine, EngineFactory};
pub use ca::CertificateAuthority;
pub use error::{CaError, NoFreePortError, ProxyError, ProxyResult};
pub use frame::{Decoded, Direction, Frame};
pub use queue::FrameQueue;
pub use service::{ProxyConfig, ProxyService, ProxyState, ProxyStatus, QueueDepths};
pub use websocket::{Opcode, WsFrame};
