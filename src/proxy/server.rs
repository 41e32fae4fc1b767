//! Listener task and per-connection plumbing.
//!
//! One [`ProxyServer`] runs per started [`ProxyService`](super::ProxyService).
//! It accepts connections until the shutdown signal, serving each with
//! hyper's HTTP/1.1 server (with upgrades, for CONNECT). Every connection and
//! tunnel task is spawned on the listener's [`TaskTracker`] and stops early
//! when the listener's [`CancellationToken`] fires.
//!
//! ```text
//! accept loop ──spawn──▶ connection task ──CONNECT──▶ tunnel task ──▶ relay
//!      │                        │                          │
//!      └── shutdown (watch)     └───────── cancel (token) ─┘
//! ```

use super::addon::EngineFactory;
use super::connect::{log_connection_error, proxy_request, Route};
use super::error::ProxyError;
use super::relay::FrameSink;
use super::tls::TlsInterceptor;
use crate::telemetry::Reporter;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Pause after a failed accept; errors such as EMFILE persist for a while.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by every connection of one listener.
pub struct ListenerContext {
    tls: TlsInterceptor,
    engines: EngineFactory,
    sink: FrameSink,
    reporter: Arc<dyn Reporter>,
    http_client: Client<HttpConnector, Incoming>,
    passthrough_hosts: Vec<String>,
    tls_ports: Vec<u16>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ListenerContext {
    /// Bundle the per-listener state.
    pub fn new(
        tls: TlsInterceptor,
        engines: EngineFactory,
        sink: FrameSink,
        reporter: Arc<dyn Reporter>,
        passthrough_hosts: &[String],
        tls_ports: &[u16],
    ) -> Self {
        Self {
            tls,
            engines,
            sink,
            reporter,
            http_client: Client::builder(TokioExecutor::new()).build_http(),
            passthrough_hosts: passthrough_hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            tls_ports: tls_ports.to_vec(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Decide how a CONNECT to `host:port` is handled.
    pub fn route(&self, host: &str, port: u16) -> Route {
        if self.passthrough_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            Route::Passthrough
        } else if self.tls_ports.contains(&port) {
            Route::InterceptTls
        } else {
            Route::Plain
        }
    }

    /// Spawn a connection-scoped task that is drained on stop and cancelled on close.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("Connection task cancelled"),
                _ = task => {}
            }
        });
    }

    pub(crate) fn tls(&self) -> &TlsInterceptor {
        &self.tls
    }

    pub(crate) fn engines(&self) -> &EngineFactory {
        &self.engines
    }

    pub(crate) fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub(crate) fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    pub(crate) fn http_client(&self) -> &Client<HttpConnector, Incoming> {
        &self.http_client
    }

    /// Tracker of live connection and tunnel tasks.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Cancel every live connection and tunnel task.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }
}

/// The accept loop of one listener.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a server for an already bound listener.
    pub fn new(listener: TcpListener, ctx: Arc<ListenerContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            ctx,
            shutdown_rx,
        }
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Returns the listener so the caller decides when the socket closes.
    pub async fn run(self) -> TcpListener {
        let mut shutdown_rx = self.shutdown_rx;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted proxy connection from {}", peer);
                        spawn_connection_handler(&self.ctx, stream);
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Proxy accept loop stopping");
                        break;
                    }
                }
            }
        }
        self.listener
    }
}

fn spawn_connection_handler(ctx: &Arc<ListenerContext>, stream: TcpStream) {
    let conn_ctx = ctx.clone();
    ctx.spawn(async move {
        if let Err(e) = handle_connection(stream, conn_ctx).await {
            log_connection_error("Proxy connection", &e);
        }
    });
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ListenerContext>) -> Result<(), ProxyError> {
    stream.set_nodelay(true)?;
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| proxy_request(req, ctx.clone()));

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}
