//! Proxy lifecycle: start, stop, close and status.
//!
//! ```text
//!            start()                 bound
//! Stopped ───────────▶ Starting ───────────▶ Listening
//!    ▲                    │ error                │ stop() / close()
//!    └────────────────────┴──── Stopping ◀───────┘
//! ```
//!
//! `start()` and `stop()` serialize on one lifecycle lock, so callers never
//! observe a half-started listener. The status snapshot is kept separately so
//! [`ProxyService::describe`] never waits on a transition.

use super::addon::EngineFactory;
use super::ca::CertificateAuthority;
use super::error::ProxyResult;
use super::frame::Direction;
use super::ports;
use super::queue::FrameQueue;
use super::relay::FrameSink;
use super::server::{ListenerContext, ProxyServer};
use super::tls::TlsInterceptor;
use crate::telemetry::{PROXY_QUEUE_DEPTH, Reporter};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Candidates tried by `start()`: the preferred port and the one after it.
pub const START_ATTEMPTS: u16 = 2;

/// Default preferred listen port.
pub const DEFAULT_PORT: u16 = 9000;
/// Default certificate directory, relative to the working directory.
pub const DEFAULT_CERT_DIR: &str = ".mitm_certs";
/// Default capacity of each frame queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default drain period for `stop()`.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds to.
    pub listen_host: IpAddr,
    /// Preferred port; `start()` may fall back to the next one.
    pub port: u16,
    /// Directory holding the interception CA.
    pub cert_dir: PathBuf,
    /// Builds the decoders for each accepted connection.
    pub engines: EngineFactory,
    /// Capacity of the client-to-origin queue.
    pub inbound_capacity: usize,
    /// Capacity of the origin-to-client queue.
    pub outbound_capacity: usize,
    /// How long `stop()` lets open connections drain.
    pub stop_grace: Duration,
    /// Hosts tunnelled without interception or decoding.
    pub passthrough_hosts: Vec<String>,
    /// CONNECT ports whose traffic is TLS-terminated.
    pub tls_ports: Vec<u16>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            engines: EngineFactory::default(),
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_grace: DEFAULT_STOP_GRACE,
            passthrough_hosts: vec!["localhost".into(), "127.0.0.1".into(), "::1".into()],
            tls_ports: vec![443],
        }
    }
}

impl ProxyConfig {
    /// Set the preferred port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the certificate directory.
    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = dir.into();
        self
    }

    /// Set the engine factory.
    pub fn with_engines(mut self, engines: EngineFactory) -> Self {
        self.engines = engines;
        self
    }

    /// Set both queue capacities.
    pub fn with_queue_capacity(mut self, inbound: usize, outbound: usize) -> Self {
        self.inbound_capacity = inbound;
        self.outbound_capacity = outbound;
        self
    }

    /// Set the stop grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the passthrough hosts.
    pub fn with_passthrough_hosts(mut self, hosts: Vec<String>) -> Self {
        self.passthrough_hosts = hosts;
        self
    }

    /// Set the intercepted TLS ports.
    pub fn with_tls_ports(mut self, ports: Vec<u16>) -> Self {
        self.tls_ports = ports;
        self
    }
}

/// Lifecycle state of a [`ProxyService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    pub state: ProxyState,
    pub host: IpAddr,
    /// Bound port while listening, the preferred port otherwise.
    pub port: u16,
    pub inbound: usize,
    pub outbound: usize,
    /// Frames dropped on both queues since construction.
    pub dropped: u64,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            ProxyState::Listening => write!(
                f,
                "running on http://{} ({} inbound / {} outbound frames queued)",
                SocketAddr::new(self.host, self.port),
                self.inbound,
                self.outbound
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Current depth of both frame queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepths {
    pub inbound: usize,
    pub outbound: usize,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: ProxyState,
    port: u16,
}

struct Running {
    ctx: Arc<ListenerContext>,
    shutdown_tx: watch::Sender<bool>,
    accept: JoinHandle<TcpListener>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    ca: Option<Arc<CertificateAuthority>>,
}

/// The intercepting proxy.
///
/// Frames decoded from every connection land in the [`inbound`](Self::inbound)
/// and [`outbound`](Self::outbound) queues, which outlive individual
/// start/stop cycles.
pub struct ProxyService {
    config: ProxyConfig,
    reporter: Arc<dyn Reporter>,
    inbound: Arc<FrameQueue>,
    outbound: Arc<FrameQueue>,
    lifecycle: Mutex<Lifecycle>,
    status: RwLock<Snapshot>,
}

impl ProxyService {
    /// Create a stopped service.
    pub fn new(config: ProxyConfig, reporter: Arc<dyn Reporter>) -> Self {
        let inbound = Arc::new(FrameQueue::new(Direction::Inbound, config.inbound_capacity));
        let outbound = Arc::new(FrameQueue::new(Direction::Outbound, config.outbound_capacity));
        let status = RwLock::new(Snapshot {
            state: ProxyState::Stopped,
            port: config.port,
        });
        Self {
            config,
            reporter,
            inbound,
            outbound,
            lifecycle: Mutex::new(Lifecycle::default()),
            status,
        }
    }

    /// Configuration the service was built with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start listening and return the bound port.
    ///
    /// Calling this while listening returns the current port.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NoFreePort`] when neither the preferred port nor
    /// the next one is free, or the CA/bind error otherwise. The service is
    /// back in [`ProxyState::Stopped`] after any error.
    pub async fn start(&self) -> ProxyResult<u16> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running.is_some() {
            let port = self.snapshot().port;
            debug!("Proxy already listening on {}", port);
            return Ok(port);
        }

        self.set_status(ProxyState::Starting, self.config.port);
        match self.bind_and_spawn(&mut lifecycle).await {
            Ok(port) => {
                self.set_status(ProxyState::Listening, port);
                info!("Proxy listening on {}", SocketAddr::new(self.config.listen_host, port));
                Ok(port)
            }
            Err(e) => {
                self.set_status(ProxyState::Stopped, self.config.port);
                warn!("Proxy failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(&self, lifecycle: &mut Lifecycle) -> ProxyResult<u16> {
        let port = ports::allocate_on(self.config.listen_host, self.config.port, START_ATTEMPTS)?;
        if port != self.config.port {
            info!("Preferred port {} busy, using {}", self.config.port, port);
        }

        let ca = match &lifecycle.ca {
            Some(ca) => ca.clone(),
            None => {
                let ca = Arc::new(CertificateAuthority::load_or_generate(&self.config.cert_dir)?);
                info!("Interception CA: {}", ca.cert_path().display());
                lifecycle.ca = Some(ca.clone());
                ca
            }
        };

        let listener = TcpListener::bind(SocketAddr::new(self.config.listen_host, port)).await?;
        let port = listener.local_addr()?.port();

        let sink = FrameSink::new(self.inbound.clone(), self.outbound.clone(), self.reporter.clone());
        let ctx = Arc::new(ListenerContext::new(
            TlsInterceptor::new(ca),
            self.config.engines.clone(),
            sink,
            self.reporter.clone(),
            &self.config.passthrough_hosts,
            &self.config.tls_ports,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(ProxyServer::new(listener, ctx.clone(), shutdown_rx).run());

        lifecycle.running = Some(Running {
            ctx,
            shutdown_tx,
            accept,
        });
        Ok(port)
    }

    /// Stop accepting, let connections drain for the configured grace period,
    /// then cancel the rest. No-op when stopped.
    pub async fn stop(&self) {
        self.shutdown(Some(self.config.stop_grace)).await;
    }

    /// Like [`stop`](Self::stop) with an explicit grace period.
    pub async fn stop_with_grace(&self, grace: Duration) {
        self.shutdown(Some(grace)).await;
    }

    /// Tear down immediately, cancelling open connections without draining.
    pub async fn close(&self) {
        self.shutdown(None).await;
    }

    async fn shutdown(&self, grace: Option<Duration>) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            return;
        };

        let port = self.snapshot().port;
        self.set_status(ProxyState::Stopping, port);
        info!("Stopping proxy on port {}", port);

        if grace.is_none() {
            running.ctx.cancel_all();
        }
        let _ = running.shutdown_tx.send(true);
        let listener = match running.accept.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("Proxy accept task ended abnormally: {}", e);
                None
            }
        };

        let tracker = running.ctx.tracker();
        tracker.close();
        if let Some(grace) = grace
            && !tracker.is_empty()
        {
            debug!("Draining {} connection task(s)", tracker.len());
            if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                warn!(
                    "{} connection task(s) still open after {:?}, cancelling",
                    tracker.len(),
                    grace
                );
                running.ctx.cancel_all();
            }
        }
        tracker.wait().await;

        drop(listener);
        self.set_status(ProxyState::Stopped, self.config.port);
        info!("Proxy stopped");
    }

    /// Snapshot of state, port and queue depths. Never waits on a transition.
    pub fn describe(&self) -> ProxyStatus {
        let snapshot = self.snapshot();
        ProxyStatus {
            state: snapshot.state,
            host: self.config.listen_host,
            port: snapshot.port,
            inbound: self.inbound.len(),
            outbound: self.outbound.len(),
            dropped: self.inbound.dropped() + self.outbound.dropped(),
        }
    }

    /// Current queue depths.
    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            inbound: self.inbound.len(),
            outbound: self.outbound.len(),
        }
    }

    /// Sample both queue depths into the [`PROXY_QUEUE_DEPTH`] gauge.
    pub fn report_queue_depths(&self) {
        let depths = self.queue_depths();
        self.reporter
            .gauge(PROXY_QUEUE_DEPTH, Direction::Inbound.as_str(), depths.inbound as f64);
        self.reporter
            .gauge(PROXY_QUEUE_DEPTH, Direction::Outbound.as_str(), depths.outbound as f64);
    }

    /// Client-to-origin frames.
    pub fn inbound(&self) -> Arc<FrameQueue> {
        self.inbound.clone()
    }

    /// Origin-to-client frames.
    pub fn outbound(&self) -> Arc<FrameQueue> {
        self.outbound.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        self.snapshot().state
    }

    /// Bound port while listening, the preferred port otherwise.
    pub fn port(&self) -> u16 {
        self.snapshot().port
    }

    /// Loaded interception CA, once the service has started at least once.
    pub async fn certificate_authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.lifecycle.lock().await.ca.clone()
    }

    fn snapshot(&self) -> Snapshot {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: ProxyState, port: u16) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = Snapshot { state, port };
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            running.ctx.cancel_all();
            let _ = running.shutdown_tx.send(true);
            running.accept.abort();
        }
    }
}
