//! Automation session seam.
//!
//! A [`SessionProvider`] creates sessions and probes their liveness; the
//! session itself drives one browser. Implementations: `WebDriverProvider`
//! (W3C WebDriver over HTTP) and the mocks in the tests.

use super::command::{ChannelId, WaitState};
use super::error::SessionResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// One browser session, owned by exactly one channel worker.
#[async_trait]
pub trait AutomationSession: Send {
    /// Load `url` in the current page.
    async fn navigate(&mut self, url: &str) -> SessionResult<()>;

    /// Click the first element matching `selector`.
    async fn click(&mut self, selector: &str) -> SessionResult<()>;

    /// Replace the value of the element matching `selector` with `text`.
    async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()>;

    /// Set a local file on a file input.
    async fn upload(&mut self, selector: &str, path: &Path) -> SessionResult<()>;

    /// Wait until the element matching `selector` reaches `state`.
    async fn wait_for(&mut self, selector: &str, state: WaitState) -> SessionResult<()>;

    /// Capture the page into `path` and return the path written.
    async fn screenshot(&mut self, path: &Path) -> SessionResult<PathBuf>;

    /// Open pages/windows as of the last command.
    fn page_count(&self) -> usize;

    /// Release the session. Errors are logged by the caller.
    async fn close(&mut self) -> SessionResult<()>;
}

/// Factory and liveness probe for sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: AutomationSession + 'static;

    /// Create a fresh session for `channel`.
    async fn create(&self, channel: &ChannelId) -> SessionResult<Self::Session>;

    /// Whether `session` can still take commands.
    async fn is_alive(&self, session: &mut Self::Session) -> bool;
}
