//! Worker pool behavior against an in-memory session provider.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tankbot::automation::{
    AutomationSession, ChannelId, OperationOutput, SessionError, SessionProvider, SessionResult,
    WaitState, WorkerError, WorkerPool, WorkerSettings,
};
use tankbot::telemetry::{
    AUTOMATION_COMMANDS_TOTAL, AUTOMATION_SESSIONS_RECREATED_TOTAL, MemoryReporter, NullReporter,
};

const WAIT: Duration = Duration::from_secs(5);

/// Shared record of what every session did.
#[derive(Default)]
struct Browser {
    log: Mutex<Vec<String>>,
    created: AtomicUsize,
    closed: AtomicUsize,
    dead: AtomicBool,
}

impl Browser {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

struct FakeSession {
    browser: Arc<Browser>,
    channel: ChannelId,
    pages: usize,
}

impl FakeSession {
    fn record(&self, entry: String) {
        self.browser.log.lock().unwrap().push(format!("{} {}", self.channel, entry));
    }
}

#[async_trait]
impl AutomationSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> SessionResult<()> {
        self.record(format!("navigate {}", url));
        if url == "dead://" {
            return Err(SessionError::Dead("target closed".into()));
        }
        tokio::task::yield_now().await;
        self.pages = 1;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> SessionResult<()> {
        self.record(format!("click {}", selector));
        Ok(())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()> {
        self.record(format!("fill {} {}", selector, text));
        Ok(())
    }

    async fn upload(&mut self, selector: &str, path: &Path) -> SessionResult<()> {
        self.record(format!("upload {} {}", selector, path.display()));
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, _state: WaitState) -> SessionResult<()> {
        self.record(format!("wait_for {}", selector));
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn screenshot(&mut self, path: &Path) -> SessionResult<PathBuf> {
        Ok(path.to_path_buf())
    }

    fn page_count(&self) -> usize {
        self.pages
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.browser.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeProvider(Arc<Browser>);

#[async_trait]
impl SessionProvider for FakeProvider {
    type Session = FakeSession;

    async fn create(&self, channel: &ChannelId) -> SessionResult<FakeSession> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        self.0.dead.store(false, Ordering::SeqCst);
        Ok(FakeSession {
            browser: self.0.clone(),
            channel: channel.clone(),
            pages: 0,
        })
    }

    async fn is_alive(&self, _session: &mut FakeSession) -> bool {
        !self.0.dead.load(Ordering::SeqCst)
    }
}

fn pool(settings: WorkerSettings) -> (Arc<Browser>, WorkerPool<FakeProvider>) {
    let browser = Arc::new(Browser::default());
    let pool = WorkerPool::new(
        Arc::new(FakeProvider(browser.clone())),
        settings,
        Arc::new(NullReporter),
    );
    (browser, pool)
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn test_commands_run_in_submission_order() {
    let (browser, pool) = pool(WorkerSettings::default());

    let first = pool.submit("42", "navigate", &args(&["https://game.example/lobby"])).unwrap();
    let second = pool.submit("42", "click", &args(&["#play"])).unwrap();
    let third = pool.submit("42", "fill", &args(&["#name", "tank"])).unwrap();

    assert_eq!(third.await.unwrap(), OperationOutput::Completed);
    assert_eq!(second.await.unwrap(), OperationOutput::Completed);
    assert_eq!(first.await.unwrap(), OperationOutput::Completed);
    assert_eq!(
        browser.log(),
        vec![
            "42 navigate https://game.example/lobby",
            "42 click #play",
            "42 fill #name tank",
        ]
    );
    pool.close_all().await;
}

#[tokio::test]
async fn test_channels_get_separate_sessions() {
    let (browser, pool) = pool(WorkerSettings::default());

    pool.enqueue("42", "navigate", &args(&["https://a.example"])).await.unwrap();
    pool.enqueue("7", "navigate", &args(&["https://b.example"])).await.unwrap();
    pool.enqueue("42", "click", &args(&["#go"])).await.unwrap();

    assert_eq!(browser.created.load(Ordering::SeqCst), 2);
    let readout = pool.status_readout();
    let channels: Vec<&str> = readout.iter().map(|s| s.channel.as_str()).collect();
    assert_eq!(channels, vec!["42", "7"]);
    assert!(readout.iter().all(|s| s.idle && s.queue_len == 0 && s.pages == 1));

    pool.close_all().await;
    assert_eq!(browser.closed.load(Ordering::SeqCst), 2);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_full_queue_rejects_command() {
    let (browser, pool) = pool(WorkerSettings {
        queue_capacity: 1,
        ..WorkerSettings::default()
    });

    // The worker task has not run yet, so the first command still occupies the queue.
    let queued = pool.submit("42", "navigate", &args(&["https://a.example"])).unwrap();
    let err = pool.submit("42", "click", &args(&["#play"])).unwrap_err();

    assert_eq!(
        err,
        WorkerError::QueueFull {
            channel: "42".to_string(),
            capacity: 1,
        }
    );
    assert_eq!(queued.await.unwrap(), OperationOutput::Completed);
    assert_eq!(browser.log(), vec!["42 navigate https://a.example"]);
    pool.close_all().await;
}

#[tokio::test]
async fn test_parse_errors_do_not_create_workers() {
    let (browser, pool) = pool(WorkerSettings::default());

    let unknown = pool.enqueue("42", "teleport", &[]).await.unwrap_err();
    assert_eq!(unknown, WorkerError::UnknownOperation("teleport".to_string()));

    let arity = pool.enqueue("42", "fill", &args(&["#name"])).await.unwrap_err();
    assert!(matches!(arity, WorkerError::InvalidArguments { .. }));

    assert!(pool.is_empty());
    assert_eq!(browser.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_health_check_recreates_dead_session_once() {
    let browser = Arc::new(Browser::default());
    let reporter = Arc::new(MemoryReporter::new());
    let pool = WorkerPool::new(
        Arc::new(FakeProvider(browser.clone())),
        WorkerSettings::default(),
        reporter.clone(),
    );

    pool.enqueue("42", "navigate", &args(&["https://a.example"])).await.unwrap();
    assert_eq!(
        pool.enqueue("42", "health_check", &[]).await.unwrap(),
        OperationOutput::Healthy { recreated: false }
    );

    browser.dead.store(true, Ordering::SeqCst);
    assert_eq!(
        pool.enqueue("42", "health-check", &[]).await.unwrap(),
        OperationOutput::Healthy { recreated: true }
    );
    assert_eq!(browser.created.load(Ordering::SeqCst), 2);
    assert_eq!(reporter.counter(AUTOMATION_SESSIONS_RECREATED_TOTAL, "health_check"), 1);
    assert_eq!(reporter.counter(AUTOMATION_COMMANDS_TOTAL, "ok"), 3);

    pool.close_all().await;
}

#[tokio::test]
async fn test_second_dead_failure_is_surfaced() {
    let (browser, pool) = pool(WorkerSettings::default());

    let err = pool.enqueue("42", "navigate", &args(&["dead://"])).await.unwrap_err();

    assert!(matches!(err, WorkerError::OperationFailed { ref operation, .. } if operation == "navigate"));
    assert_eq!(browser.created.load(Ordering::SeqCst), 2);
    assert_eq!(browser.log(), vec!["42 navigate dead://", "42 navigate dead://"]);

    // The worker keeps serving the channel afterwards.
    pool.enqueue("42", "click", &args(&["#retry"])).await.unwrap();
    pool.close_all().await;
}

#[tokio::test]
async fn test_close_channel_fails_pending_commands() {
    let (browser, pool) = pool(WorkerSettings::default());

    let stuck = pool.submit("42", "wait_for", &args(&["#never", "visible"])).unwrap();
    let queued = pool.submit("42", "click", &args(&["#play"])).unwrap();
    tokio::task::yield_now().await;

    tokio::time::timeout(WAIT, pool.close_channel("42")).await.unwrap();

    assert_eq!(stuck.await.unwrap_err(), WorkerError::Closed);
    assert_eq!(queued.await.unwrap_err(), WorkerError::Closed);
    assert!(pool.is_empty());
    assert!(!browser.log().contains(&"42 click #play".to_string()));
}

#[tokio::test]
async fn test_close_all_then_fresh_worker() {
    let (browser, pool) = pool(WorkerSettings::default());

    pool.enqueue("42", "navigate", &args(&["https://a.example"])).await.unwrap();
    pool.close_all().await;
    assert!(pool.status_readout().is_empty());
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);

    pool.enqueue("42", "navigate", &args(&["https://a.example"])).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(browser.created.load(Ordering::SeqCst), 2);
    pool.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_creates_one_worker() {
    let (browser, pool) = pool(WorkerSettings::default());
    let pool = Arc::new(pool);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let selector = vec![format!("#b{}", i)];
                pool.enqueue("42", "click", &selector).await
            })
        })
        .collect();
    for task in tasks {
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    assert_eq!(pool.len(), 1);
    assert_eq!(browser.created.load(Ordering::SeqCst), 1);
    assert_eq!(browser.log().len(), 8);
    pool.close_all().await;
}
