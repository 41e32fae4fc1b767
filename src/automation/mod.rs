//! Per-channel browser automation.
//!
//! Every conversation channel gets one [`ChannelWorker`] that owns one
//! browser session and runs that channel's commands one at a time. The
//! [`WorkerPool`] creates workers on first use and tears them down on request.
//!
//! ```text
//!                ┌──────────────────────── WorkerPool ───────────────────────┐
//! enqueue("42") ─┼─▶ ChannelWorker "42" ─▶ [queue] ─▶ task ─▶ session "42"   │
//! enqueue("7")  ─┼─▶ ChannelWorker "7"  ─▶ [queue] ─▶ task ─▶ session "7"    │
//!                └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions come from a [`SessionProvider`]; [`WebDriverProvider`] drives a
//! real browser through chromedriver or geckodriver.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tankbot::automation::{WebDriverOptions, WebDriverProvider, WorkerPool, WorkerSettings};
//! use tankbot::telemetry::NullReporter;
//!
//! let provider = Arc::new(WebDriverProvider::new(WebDriverOptions::default()));
//! let pool = WorkerPool::new(provider, WorkerSettings::default(), Arc::new(NullReporter));
//! pool.enqueue("42", "navigate", &["https://example.com".into()]).await?;
//! pool.close_all().await;
//! ```

pub mod command;
pub mod error;
pub mod pool;
pub mod session;
pub mod webdriver;
pub mod worker;

pub use command::{ChannelId, Operation, OperationOutput, WaitState};
pub use error::{SessionError, SessionResult, WorkerError, WorkerResult};
pub use pool::{WorkerPool, WorkerStatus};
pub use session::{AutomationSession, SessionProvider};
pub use webdriver::{Browser, WebDriverOptions, WebDriverProvider, WebDriverSession};
pub use worker::{ChannelWorker, Completion, WorkerSettings};
