//! Request handling: CONNECT tunnels and plain HTTP forwarding.
//!
//! A CONNECT target is routed one of three ways:
//!
//! | Target                      | Route        | Decoded |
//! |-----------------------------|--------------|---------|
//! | passthrough host            | raw tunnel   | no      |
//! | port in `tls_ports`         | TLS on both sides, CA-signed leaf | yes |
//! | anything else               | TCP tunnel   | yes     |
//!
//! The tunnel is set up after `200 Connection Established` has been sent,
//! in a task tracked by the listener so that `stop()` can drain it.

use super::error::{ProxyError, ProxyResult};
use super::relay::relay;
use super::server::ListenerContext;
use super::tls::server_name;
use crate::telemetry::PROXY_CONNECTIONS_TOTAL;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::HeaderName;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Response body type used by the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// How a CONNECT tunnel is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Relay bytes untouched and undecoded.
    Passthrough,
    /// Terminate TLS on both sides and decode the plaintext.
    InterceptTls,
    /// Relay and decode the raw TCP stream.
    Plain,
}

const HOP_BY_HOP: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Dispatch one request from a proxy client. Failures become error responses.
pub(crate) async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ListenerContext>,
) -> Result<Response<ProxyBody>, Infallible> {
    let result = if req.method() == Method::CONNECT {
        handle_connect(req, ctx).await
    } else {
        handle_http(req, &ctx).await
    };

    Ok(result.unwrap_or_else(|e| {
        debug!("Proxy request failed: {}", e);
        let status = match e {
            ProxyError::InvalidConnect(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        error_response(status, &e.to_string())
    }))
}

async fn handle_connect(req: Request<Incoming>, ctx: Arc<ListenerContext>) -> ProxyResult<Response<ProxyBody>> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?
        .to_string();
    let (host, port) = parse_host_port(&target)?;
    let route = ctx.route(&host, port);

    debug!("CONNECT {}:{} routed as {:?}", host, port, route);
    ctx.reporter().increment(PROXY_CONNECTIONS_TOTAL, "connect");

    let tunnel_ctx = ctx.clone();
    ctx.spawn(async move {
        let result = match upgrade(req).await {
            Ok(upgraded) => tunnel(upgraded, &host, port, route, &tunnel_ctx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Tunnel closed for {}:{}", host, port),
            Err(e) => log_connection_error(&format!("Tunnel to {}:{}", host, port), &e),
        }
    });

    Ok(Response::new(empty_body()))
}

/// Take over the client connection once the CONNECT response is sent.
async fn upgrade<B>(req: Request<B>) -> ProxyResult<Upgraded> {
    hyper::upgrade::on(req)
        .await
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))
}

async fn tunnel(
    upgraded: Upgraded,
    host: &str,
    port: u16,
    route: Route,
    ctx: &ListenerContext,
) -> ProxyResult<()> {
    let upstream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;
    upstream.set_nodelay(true)?;
    let client = TokioIo::new(upgraded);

    let (sent, received) = match route {
        Route::Passthrough => relay(client, upstream, Vec::new(), ctx.sink()).await?,
        Route::Plain => relay(client, upstream, ctx.engines().new_engines(), ctx.sink()).await?,
        Route::InterceptTls => {
            let upstream = ctx
                .tls()
                .connector()
                .connect(server_name(host)?, upstream)
                .await
                .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;
            let client = ctx
                .tls()
                .acceptor(host)
                .accept(client)
                .await
                .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;
            debug!("TLS intercepted for {}:{}", host, port);
            relay(client, upstream, ctx.engines().new_engines(), ctx.sink()).await?
        }
    };

    debug!("Relayed {} bytes out, {} bytes back for {}:{}", sent, received, host, port);
    Ok(())
}

/// Forward a plain (non-CONNECT) HTTP request as-is.
async fn handle_http(mut req: Request<Incoming>, ctx: &ListenerContext) -> ProxyResult<Response<ProxyBody>> {
    let host = req
        .uri()
        .host()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing host in request URI".into()))?
        .to_string();

    debug!("HTTP proxy request to {}", host);
    ctx.reporter().increment(PROXY_CONNECTIONS_TOTAL, "http");

    for name in HOP_BY_HOP {
        req.headers_mut().remove(HeaderName::from_static(name));
    }

    let response = ctx
        .http_client()
        .request(req)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: host,
            message: e.to_string(),
        })?;

    Ok(response.map(|body| body.boxed()))
}

/// Log a per-connection failure; disconnects are routine and logged quietly.
pub(crate) fn log_connection_error(what: &str, err: &ProxyError) {
    let quiet = match err {
        ProxyError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        other => {
            let text = other.to_string().to_lowercase();
            text.contains("connection reset") || text.contains("broken pipe")
        }
    };
    if quiet {
        debug!("{} ended: {}", what, err);
    } else {
        warn!("{} failed: {}", what, err);
    }
}

/// Parse `host:port` from a CONNECT authority, defaulting to port 443.
///
/// IPv6 literals are accepted in brackets (`[::1]:443`).
pub fn parse_host_port(authority: &str) -> ProxyResult<(String, u16)> {
    let invalid_port = |p: &str| ProxyError::InvalidConnect(format!("Invalid port: {}", p));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::InvalidConnect(format!("Unterminated IPv6 literal: {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid_port(p))?,
            None => 443,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, p)) => Ok((host.to_string(), p.parse().map_err(|_| invalid_port(p))?)),
        None => Ok((authority.to_string(), 443)),
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content)).map_err(|never| match never {}).boxed()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    response
}
