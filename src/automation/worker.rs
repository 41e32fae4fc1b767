//! One channel's serialized command executor.
//!
//! Each [`ChannelWorker`] owns a bounded command queue and one background
//! task. The task owns the automation session exclusively and runs commands
//! strictly in submission order:
//!
//! ```text
//! submit() ──try_send──▶ [ bounded queue ] ──▶ worker task ──▶ session
//!    │                                              │
//!    └──────── Completion ◀──────── oneshot ────────┘
//! ```
//!
//! A session that dies mid-command is replaced and the command retried once.
//! `health_check` replaces a dead session without reporting an error.

use super::command::{ChannelId, Operation, OperationOutput};
use super::error::{SessionError, WorkerError, WorkerResult};
use super::session::{AutomationSession, SessionProvider};
use crate::telemetry::{
    AUTOMATION_COMMAND_DURATION_SECONDS, AUTOMATION_COMMANDS_TOTAL,
    AUTOMATION_SESSIONS_RECREATED_TOTAL, Reporter,
};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-channel command queue capacity.
pub const DEFAULT_COMMAND_QUEUE: usize = 16;
/// Default liveness probe timeout.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default directory for screenshots taken without an explicit path.
pub const DEFAULT_SCREENSHOT_DIR: &str = "screenshots";

const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    pub health_check_timeout: Duration,
    pub screenshot_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_COMMAND_QUEUE,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            screenshot_dir: PathBuf::from(DEFAULT_SCREENSHOT_DIR),
        }
    }
}

type Reply = oneshot::Sender<WorkerResult<OperationOutput>>;

struct Job {
    op: Operation,
    reply: Reply,
}

/// Resolves when a submitted command finishes.
///
/// Resolves to [`WorkerError::Closed`] if the worker goes away first.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<WorkerResult<OperationOutput>>,
}

impl Future for Completion {
    type Output = WorkerResult<OperationOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(WorkerError::Closed)))
    }
}

#[derive(Debug, Default)]
struct Shared {
    busy: AtomicBool,
    pages: AtomicUsize,
    closed: AtomicBool,
}

/// Serialized executor for one channel.
pub struct ChannelWorker {
    channel: ChannelId,
    capacity: usize,
    tx: mpsc::Sender<Job>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelWorker {
    /// Start a worker and its background task. The session is created on the
    /// first command.
    pub fn spawn<P: SessionProvider>(
        channel: ChannelId,
        provider: Arc<P>,
        settings: WorkerSettings,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let capacity = settings.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();

        let runner = Runner {
            channel: channel.clone(),
            provider,
            session: None,
            settings,
            reporter,
            shared: shared.clone(),
        };
        let task = tokio::spawn(runner.run(rx, cancel.clone()));
        debug!("Started worker for channel {}", channel);

        Self {
            channel,
            capacity,
            tx,
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue `op` without waiting.
    ///
    /// # Errors
    ///
    /// [`WorkerError::QueueFull`] when the queue is at capacity,
    /// [`WorkerError::Closed`] after [`close`](Self::close).
    pub fn submit(&self, op: Operation) -> WorkerResult<Completion> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(WorkerError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(Job { op, reply }) {
            Ok(()) => Ok(Completion { rx }),
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!(
                    "Rejecting {} for channel {}: queue full",
                    job.op.name(),
                    self.channel
                );
                Err(WorkerError::QueueFull {
                    channel: self.channel.to_string(),
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Closed),
        }
    }

    /// Queue `op` and wait for its result.
    pub async fn enqueue(&self, op: Operation) -> WorkerResult<OperationOutput> {
        self.submit(op)?.await
    }

    /// Stop the worker: fail the running and queued commands with
    /// [`WorkerError::Closed`] and close the session. Idempotent.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take()
            && let Err(e) = handle.await
        {
            warn!("Worker task for channel {} ended abnormally: {}", self.channel, e);
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Commands waiting behind the running one.
    pub fn queue_len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `false` while a command is executing.
    pub fn is_idle(&self) -> bool {
        !self.shared.busy.load(Ordering::Acquire)
    }

    /// Page count cached after the last command.
    pub fn pages(&self) -> usize {
        self.shared.pages.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the background task.
struct Runner<P: SessionProvider> {
    channel: ChannelId,
    provider: Arc<P>,
    session: Option<P::Session>,
    settings: WorkerSettings,
    reporter: Arc<dyn Reporter>,
    shared: Arc<Shared>,
}

impl<P: SessionProvider> Runner<P> {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.shared.busy.store(true, Ordering::Release);
            let started = Instant::now();
            let name = job.op.name();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.execute(&job.op) => Some(result),
            };
            let Some(result) = result else {
                debug!("{} for channel {} interrupted by close", name, self.channel);
                let _ = job.reply.send(Err(WorkerError::Closed));
                break;
            };

            self.report(name, started.elapsed(), &result);
            if let Some(session) = &self.session {
                self.shared.pages.store(session.page_count(), Ordering::Release);
            }
            self.shared.busy.store(false, Ordering::Release);

            if job.reply.send(result).is_err() {
                debug!("Caller for {} on channel {} went away", name, self.channel);
            }
        }

        self.shutdown(rx).await;
    }

    async fn shutdown(&mut self, mut rx: mpsc::Receiver<Job>) {
        rx.close();
        let mut failed = 0usize;
        while let Ok(job) = rx.try_recv() {
            let _ = job.reply.send(Err(WorkerError::Closed));
            failed += 1;
        }
        if failed > 0 {
            debug!("Failed {} queued command(s) for channel {}", failed, self.channel);
        }

        self.shared.busy.store(false, Ordering::Release);
        if let Some(session) = self.session.take() {
            close_session(&self.channel, session).await;
        }
        self.shared.pages.store(0, Ordering::Release);
        info!("Worker for channel {} closed", self.channel);
    }

    async fn execute(&mut self, op: &Operation) -> WorkerResult<OperationOutput> {
        debug!("Channel {}: executing {}", self.channel, op.name());
        match op {
            Operation::HealthCheck => self.health_check().await,
            other => self.execute_with_retry(other).await,
        }
    }

    async fn health_check(&mut self) -> WorkerResult<OperationOutput> {
        let timeout = self.settings.health_check_timeout;
        let provider = self.provider.clone();
        let session = self.session("health_check").await?;

        let alive = match tokio::time::timeout(timeout, provider.is_alive(session)).await {
            Ok(alive) => alive,
            Err(_) => {
                warn!("Liveness probe for channel {} timed out after {:?}", self.channel, timeout);
                false
            }
        };
        if alive {
            return Ok(OperationOutput::Healthy { recreated: false });
        }

        warn!("Session for channel {} is dead, recreating", self.channel);
        self.recreate("health_check").await?;
        Ok(OperationOutput::Healthy { recreated: true })
    }

    async fn execute_with_retry(&mut self, op: &Operation) -> WorkerResult<OperationOutput> {
        let name = op.name();
        let screenshot = match op {
            Operation::Screenshot { path } => {
                let target =
                    screenshot_path(&self.settings.screenshot_dir, &self.channel, path.as_deref());
                prepare_screenshot_dir(&target).await?;
                Some(target)
            }
            _ => None,
        };

        let session = self.session(name).await?;
        match perform(session, op, screenshot.as_deref()).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_dead() => {
                warn!(
                    "Session for channel {} died during {}: {}; recreating and retrying",
                    self.channel, name, e
                );
                self.recreate(name).await?;
                let session = self.session(name).await?;
                perform(session, op, screenshot.as_deref())
                    .await
                    .map_err(|e| failed(name, e))
            }
            Err(e) => Err(failed(name, e)),
        }
    }

    /// The current session, created on first use.
    async fn session(&mut self, operation: &'static str) -> WorkerResult<&mut P::Session> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                info!("Creating automation session for channel {}", self.channel);
                self.provider
                    .create(&self.channel)
                    .await
                    .map_err(|e| failed(operation, e))?
            }
        };
        Ok(self.session.insert(session))
    }

    async fn recreate(&mut self, operation: &'static str) -> WorkerResult<()> {
        if let Some(old) = self.session.take() {
            close_session(&self.channel, old).await;
        }
        self.reporter.increment(AUTOMATION_SESSIONS_RECREATED_TOTAL, operation);
        self.session(operation).await.map(|_| ())
    }

    fn report(&self, operation: &'static str, elapsed: Duration, result: &WorkerResult<OperationOutput>) {
        let status = match result {
            Ok(_) => "ok",
            Err(e) => {
                warn!("Channel {}: {}", self.channel, e);
                "error"
            }
        };
        self.reporter.increment(AUTOMATION_COMMANDS_TOTAL, status);
        self.reporter
            .observe(AUTOMATION_COMMAND_DURATION_SECONDS, operation, elapsed);
    }
}

/// Where a screenshot lands: the requested path, or a timestamped file
/// under `dir`.
fn screenshot_path(dir: &Path, channel: &ChannelId, requested: Option<&Path>) -> PathBuf {
    match requested {
        Some(path) => path.to_path_buf(),
        None => dir.join(format!(
            "{}-{}.png",
            file_safe(channel.as_str()),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        )),
    }
}

async fn prepare_screenshot_dir(path: &Path) -> WorkerResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| WorkerError::OperationFailed {
            operation: "screenshot".into(),
            message: format!("Failed to create {}: {}", parent.display(), e),
        })?;
    }
    Ok(())
}

async fn perform<S: AutomationSession>(
    session: &mut S,
    op: &Operation,
    screenshot: Option<&Path>,
) -> Result<OperationOutput, SessionError> {
    match op {
        Operation::Navigate { url } => session.navigate(url).await.map(|_| OperationOutput::Completed),
        Operation::Click { selector } => session.click(selector).await.map(|_| OperationOutput::Completed),
        Operation::Fill { selector, text } => session
            .fill(selector, text)
            .await
            .map(|_| OperationOutput::Completed),
        Operation::Upload { selector, path } => session
            .upload(selector, path)
            .await
            .map(|_| OperationOutput::Completed),
        Operation::WaitFor { selector, state } => session
            .wait_for(selector, *state)
            .await
            .map(|_| OperationOutput::Completed),
        Operation::Screenshot { path } => {
            let target = screenshot
                .or(path.as_deref())
                .ok_or_else(|| SessionError::Failed("No screenshot path".into()))?;
            session.screenshot(target).await.map(OperationOutput::Screenshot)
        }
        Operation::HealthCheck => Ok(OperationOutput::Healthy { recreated: false }),
    }
}

async fn close_session<S: AutomationSession>(channel: &ChannelId, mut session: S) {
    match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => debug!("Closed session for channel {}", channel),
        Ok(Err(e)) => debug!("Closing session for channel {} failed: {}", channel, e),
        Err(_) => warn!("Closing session for channel {} timed out", channel),
    }
}

fn failed(operation: &str, err: SessionError) -> WorkerError {
    WorkerError::OperationFailed {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::command::WaitState;
    use crate::automation::error::SessionResult;
    use crate::telemetry::{MemoryReporter, NullReporter};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records calls; `navigate` to "dead://" fails as a dead session,
    /// "fail://" as a plain failure.
    #[derive(Default)]
    struct Script {
        log: StdMutex<Vec<String>>,
        created: AtomicUsize,
        closed: AtomicUsize,
        alive: AtomicBool,
    }

    struct ScriptSession {
        script: Arc<Script>,
        id: usize,
    }

    #[async_trait]
    impl AutomationSession for ScriptSession {
        async fn navigate(&mut self, url: &str) -> SessionResult<()> {
            self.script.log.lock().unwrap().push(format!("{}:navigate {}", self.id, url));
            match url {
                "dead://" => Err(SessionError::Dead("browser closed".into())),
                "fail://" => Err(SessionError::Failed("net::ERR_NAME_NOT_RESOLVED".into())),
                _ => Ok(()),
            }
        }
        async fn click(&mut self, selector: &str) -> SessionResult<()> {
            self.script.log.lock().unwrap().push(format!("{}:click {}", self.id, selector));
            Ok(())
        }
        async fn fill(&mut self, _selector: &str, _text: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn upload(&mut self, _selector: &str, _path: &Path) -> SessionResult<()> {
            Ok(())
        }
        async fn wait_for(&mut self, _selector: &str, _state: WaitState) -> SessionResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
        async fn screenshot(&mut self, path: &Path) -> SessionResult<PathBuf> {
            Ok(path.to_path_buf())
        }
        fn page_count(&self) -> usize {
            1
        }
        async fn close(&mut self) -> SessionResult<()> {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptProvider(Arc<Script>);

    #[async_trait]
    impl SessionProvider for ScriptProvider {
        type Session = ScriptSession;

        async fn create(&self, _channel: &ChannelId) -> SessionResult<ScriptSession> {
            let id = self.0.created.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.alive.store(true, Ordering::SeqCst);
            Ok(ScriptSession {
                script: self.0.clone(),
                id,
            })
        }

        async fn is_alive(&self, _session: &mut ScriptSession) -> bool {
            self.0.alive.load(Ordering::SeqCst)
        }
    }

    fn worker(settings: WorkerSettings) -> (Arc<Script>, ChannelWorker) {
        worker_with(settings, Arc::new(NullReporter))
    }

    fn worker_with(settings: WorkerSettings, reporter: Arc<dyn Reporter>) -> (Arc<Script>, ChannelWorker) {
        let script = Arc::new(Script::default());
        let worker = ChannelWorker::spawn(
            ChannelId::from("lobby"),
            Arc::new(ScriptProvider(script.clone())),
            settings,
            reporter,
        );
        (script, worker)
    }

    fn navigate(url: &str) -> Operation {
        Operation::Navigate { url: url.into() }
    }

    #[tokio::test]
    async fn test_session_created_lazily() {
        let (script, worker) = worker(WorkerSettings::default());
        tokio::task::yield_now().await;
        assert_eq!(script.created.load(Ordering::SeqCst), 0);

        worker.enqueue(navigate("https://example.com")).await.unwrap();
        assert_eq!(script.created.load(Ordering::SeqCst), 1);
        assert_eq!(worker.pages(), 1);
        assert!(worker.is_idle());
        worker.close().await;
    }

    #[tokio::test]
    async fn test_dead_session_retried_once() {
        let reporter = Arc::new(MemoryReporter::new());
        let (script, worker) = worker_with(WorkerSettings::default(), reporter.clone());

        let err = worker.enqueue(navigate("dead://")).await.unwrap_err();
        assert!(matches!(err, WorkerError::OperationFailed { ref operation, .. } if operation == "navigate"));
        // Lazy create plus one recreation.
        assert_eq!(script.created.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.counter(AUTOMATION_SESSIONS_RECREATED_TOTAL, "navigate"), 1);
        assert_eq!(reporter.counter(AUTOMATION_COMMANDS_TOTAL, "error"), 1);
        worker.close().await;
    }

    #[tokio::test]
    async fn test_plain_failure_not_retried() {
        let (script, worker) = worker(WorkerSettings::default());
        let err = worker.enqueue(navigate("fail://")).await.unwrap_err();
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
        assert_eq!(script.created.load(Ordering::SeqCst), 1);

        // The worker keeps serving.
        worker.enqueue(navigate("https://example.com")).await.unwrap();
        worker.close().await;
    }

    #[tokio::test]
    async fn test_health_check_heals_dead_session() {
        let (script, worker) = worker(WorkerSettings::default());
        assert_eq!(
            worker.enqueue(Operation::HealthCheck).await.unwrap(),
            OperationOutput::Healthy { recreated: false }
        );

        script.alive.store(false, Ordering::SeqCst);
        assert_eq!(
            worker.enqueue(Operation::HealthCheck).await.unwrap(),
            OperationOutput::Healthy { recreated: true }
        );
        assert_eq!(script.created.load(Ordering::SeqCst), 2);
        assert_eq!(script.closed.load(Ordering::SeqCst), 1);
        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_interrupts_running_command() {
        let (script, worker) = worker(WorkerSettings::default());
        let running = worker
            .submit(Operation::WaitFor {
                selector: "#never".into(),
                state: WaitState::Visible,
            })
            .unwrap();
        let queued = worker.submit(navigate("https://example.com")).unwrap();

        // Let the wait start.
        while worker.is_idle() {
            tokio::task::yield_now().await;
        }
        worker.close().await;

        assert_eq!(running.await.unwrap_err(), WorkerError::Closed);
        assert_eq!(queued.await.unwrap_err(), WorkerError::Closed);
        assert_eq!(script.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(worker.submit(navigate("x")), Err(WorkerError::Closed)));

        // Second close is a no-op.
        worker.close().await;
    }

    #[tokio::test]
    async fn test_default_screenshot_path() {
        let dir = tempfile::tempdir().unwrap();
        let (_script, worker) = worker(WorkerSettings {
            screenshot_dir: dir.path().join("shots"),
            ..WorkerSettings::default()
        });

        let output = worker.enqueue(Operation::Screenshot { path: None }).await.unwrap();
        let OperationOutput::Screenshot(path) = output else {
            panic!("expected a screenshot path, got {:?}", output);
        };
        assert!(path.starts_with(dir.path().join("shots")));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("lobby-"));
        assert!(dir.path().join("shots").is_dir());
        worker.close().await;
    }

    /// Session holding `Cell` state: `Send` but not `Sync`, like most
    /// single-owner browser handles.
    struct CellSession {
        shots: std::cell::Cell<usize>,
    }

    #[async_trait]
    impl AutomationSession for CellSession {
        async fn navigate(&mut self, _url: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn click(&mut self, _selector: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn fill(&mut self, _selector: &str, _text: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn upload(&mut self, _selector: &str, _path: &Path) -> SessionResult<()> {
            Ok(())
        }
        async fn wait_for(&mut self, _selector: &str, _state: WaitState) -> SessionResult<()> {
            Ok(())
        }
        async fn screenshot(&mut self, path: &Path) -> SessionResult<PathBuf> {
            self.shots.set(self.shots.get() + 1);
            tokio::task::yield_now().await;
            Ok(path.to_path_buf())
        }
        fn page_count(&self) -> usize {
            self.shots.get()
        }
        async fn close(&mut self) -> SessionResult<()> {
            Ok(())
        }
    }

    struct CellProvider;

    #[async_trait]
    impl SessionProvider for CellProvider {
        type Session = CellSession;

        async fn create(&self, _channel: &ChannelId) -> SessionResult<CellSession> {
            Ok(CellSession {
                shots: std::cell::Cell::new(0),
            })
        }

        async fn is_alive(&self, _session: &mut CellSession) -> bool {
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_non_sync_session_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ChannelWorker::spawn(
            ChannelId::from("guild/7"),
            Arc::new(CellProvider),
            WorkerSettings {
                screenshot_dir: dir.path().join("nested").join("shots"),
                ..WorkerSettings::default()
            },
            Arc::new(NullReporter),
        );

        for _ in 0..3 {
            let output = worker.enqueue(Operation::Screenshot { path: None }).await.unwrap();
            let OperationOutput::Screenshot(path) = output else {
                panic!("expected a screenshot path, got {:?}", output);
            };
            assert!(path.starts_with(dir.path().join("nested").join("shots")));
        }
        assert_eq!(worker.pages(), 3);
        worker.close().await;
    }

    #[test]
    fn test_screenshot_path_prefers_requested() {
        let channel = ChannelId::from("42");
        let requested = Path::new("/tmp/board.png");

        assert_eq!(
            screenshot_path(Path::new("shots"), &channel, Some(requested)),
            PathBuf::from("/tmp/board.png")
        );
        let generated = screenshot_path(Path::new("shots"), &channel, None);
        assert!(generated.starts_with("shots"));
        assert!(generated.to_string_lossy().ends_with(".png"));
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("guild/42:general"), "guild_42_general");
        assert_eq!(file_safe("42"), "42");
    }
}
