//! Bounded frame queues feeding the observability reader.
//!
//! Producers (one per connection) push without blocking. A full queue drops
//! the frame and counts it; proxying never waits on the reader.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use super::frame::{Direction, Frame};

/// Log every n-th drop after the first.
const DROP_LOG_INTERVAL: u64 = 1000;

/// Fixed-capacity, multi-producer, single-consumer frame queue.
#[derive(Debug)]
pub struct FrameQueue {
    direction: Direction,
    capacity: usize,
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(direction: Direction, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            direction,
            capacity,
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push without waiting. Returns `false` if the frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        if self.tx.try_send(frame).is_ok() {
            return true;
        }
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
            warn!(
                "Proxy {} queue overflow, dropping frame ({} dropped so far)",
                self.direction, dropped
            );
        }
        false
    }

    /// Wait for the next frame.
    ///
    /// Intended for a single reader; concurrent callers are served in turn.
    pub async fn recv(&self) -> Option<Frame> {
        self.rx.lock().await.recv().await
    }

    /// Take the next frame if one is ready and no other reader is waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Direction of the frames carried.
    pub fn direction(&self) -> Direction {
        self.direction
    }
}
