//! Registry of channel workers.

use super::command::{ChannelId, Operation, OperationOutput};
use super::error::WorkerResult;
use super::session::SessionProvider;
use super::worker::{ChannelWorker, Completion, WorkerSettings};
use crate::telemetry::Reporter;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub channel: ChannelId,
    pub idle: bool,
    pub queue_len: usize,
    pub pages: usize,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} queued, {} page(s))",
            self.channel,
            if self.idle { "idle" } else { "busy" },
            self.queue_len,
            self.pages
        )
    }
}

/// Maps channels to their workers, creating workers on first use.
///
/// The registry owns every worker; workers hold no reference back to it.
pub struct WorkerPool<P: SessionProvider> {
    provider: Arc<P>,
    settings: WorkerSettings,
    reporter: Arc<dyn Reporter>,
    workers: Mutex<HashMap<ChannelId, Arc<ChannelWorker>>>,
}

impl<P: SessionProvider> WorkerPool<P> {
    pub fn new(provider: Arc<P>, settings: WorkerSettings, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            provider,
            settings,
            reporter,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Parse `op` and queue it on `channel`'s worker without waiting.
    ///
    /// # Errors
    ///
    /// Parse errors, or the worker's queue-full/closed error.
    pub fn submit(&self, channel: impl Into<ChannelId>, op: &str, args: &[String]) -> WorkerResult<Completion> {
        let op = Operation::parse(op, args)?;
        self.worker(channel.into()).submit(op)
    }

    /// Parse `op`, queue it on `channel`'s worker and wait for the result.
    pub async fn enqueue(
        &self,
        channel: impl Into<ChannelId>,
        op: &str,
        args: &[String],
    ) -> WorkerResult<OperationOutput> {
        self.submit(channel, op, args)?.await
    }

    /// Snapshot of every live worker, sorted by channel.
    pub fn status_readout(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .lock()
            .values()
            .map(|worker| WorkerStatus {
                channel: worker.channel().clone(),
                idle: worker.is_idle(),
                queue_len: worker.queue_len(),
                pages: worker.pages(),
            })
            .collect();
        statuses.sort_by(|a, b| a.channel.cmp(&b.channel));
        statuses
    }

    /// Close and forget `channel`'s worker. No-op if there is none.
    pub async fn close_channel(&self, channel: impl Into<ChannelId>) {
        let channel = channel.into();
        let removed = self.lock().remove(&channel);
        if let Some(worker) = removed {
            worker.close().await;
            info!("Closed worker for channel {}", channel);
        }
    }

    /// Close and forget every worker, waiting for all of them.
    pub async fn close_all(&self) {
        let workers: Vec<Arc<ChannelWorker>> = self.lock().drain().map(|(_, w)| w).collect();
        if workers.is_empty() {
            return;
        }
        info!("Closing {} channel worker(s)", workers.len());
        join_all(workers.iter().map(|w| w.close())).await;
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn worker(&self, channel: ChannelId) -> Arc<ChannelWorker> {
        let mut workers = self.lock();
        workers
            .entry(channel)
            .or_insert_with_key(|channel| {
                debug!("Creating worker for channel {}", channel);
                Arc::new(ChannelWorker::spawn(
                    channel.clone(),
                    self.provider.clone(),
                    self.settings.clone(),
                    self.reporter.clone(),
                ))
            })
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, Arc<ChannelWorker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
