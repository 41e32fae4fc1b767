//! Bidirectional relay that feeds every chunk through the connection's engines.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::addon::Engine;
use super::frame::{Direction, Frame};
use super::queue::FrameQueue;
use crate::telemetry::{
    PROXY_FRAME_LATENCY_SECONDS, PROXY_FRAMES_DROPPED_TOTAL, PROXY_FRAMES_TOTAL, Reporter,
};

const RELAY_BUFFER: usize = 16 * 1024;

/// Destination for frames produced by connection engines.
#[derive(Clone)]
pub struct FrameSink {
    inbound: Arc<FrameQueue>,
    outbound: Arc<FrameQueue>,
    reporter: Arc<dyn Reporter>,
}

impl FrameSink {
    /// Sink pushing to the given queues and reporting through `reporter`.
    pub fn new(inbound: Arc<FrameQueue>, outbound: Arc<FrameQueue>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            inbound,
            outbound,
            reporter,
        }
    }

    /// Count the frame, queue it (dropping on overflow) and record its latency.
    pub fn publish(&self, frame: Frame, read_at: Instant) {
        let direction = frame.direction;
        let queue = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };

        self.reporter.increment(PROXY_FRAMES_TOTAL, direction.as_str());
        if !queue.push(frame) {
            self.reporter.increment(PROXY_FRAMES_DROPPED_TOTAL, direction.as_str());
        }
        self.reporter
            .observe(PROXY_FRAME_LATENCY_SECONDS, direction.as_str(), read_at.elapsed());
    }
}

/// Copy bytes both ways until both sides finish, decoding along the way.
///
/// `client` bytes are [`Direction::Inbound`], `upstream` bytes are
/// [`Direction::Outbound`]. EOF on one side shuts down the write half of the
/// other. An empty `engines` list relays without decoding.
///
/// Returns the bytes relayed in each direction.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    engines: Vec<Engine>,
    sink: &FrameSink,
) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let engines = Mutex::new(engines);
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::try_join!(
        pump(&mut client_read, &mut upstream_write, Direction::Inbound, &engines, sink),
        pump(&mut upstream_read, &mut client_write, Direction::Outbound, &engines, sink),
    )
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    engines: &Mutex<Vec<Engine>>,
    sink: &FrameSink,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let read_at = Instant::now();
        let chunk = &buf[..n];

        {
            let mut engines = engines.lock().unwrap_or_else(PoisonError::into_inner);
            for engine in engines.iter_mut() {
                for frame in engine.on_bytes(direction, chunk) {
                    sink.publish(frame, read_at);
                }
            }
        }

        writer.write_all(chunk).await?;
        total += n as u64;
    }

    writer.shutdown().await?;
    Ok(total)
}
