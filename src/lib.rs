//! tankbot: runtime core for a chat-driven game automation bot.
//!
//! # Architecture
//!
//! - **Proxy**: intercepting HTTP/HTTPS proxy that decodes the game's
//!   WebSocket traffic into inbound and outbound frame queues
//! - **Automation**: one browser session per chat channel, each driven by a
//!   worker that runs the channel's commands in order
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: counters, latencies and queue depths behind a reporter
//!   trait, exported to Prometheus by the binary

#![warn(clippy::all)]

pub mod automation;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod proxy;
pub mod telemetry;
