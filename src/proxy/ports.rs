//! Port negotiation for the proxy listener.
//!
//! Candidates are probed by binding a throwaway socket with the same options
//! the real listener uses (`SO_REUSEADDR`), then releasing it before the next
//! probe. The check is best effort: the caller binds for real immediately
//! afterwards and surfaces any race as an ordinary bind error.

use super::error::NoFreePortError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpSocket;
use tracing::debug;

/// Find a bindable loopback port, trying `preferred, preferred + 1, ...`.
///
/// See [`allocate_on`].
pub fn allocate(preferred: u16, max_attempts: u16) -> Result<u16, NoFreePortError> {
    allocate_on(IpAddr::V4(Ipv4Addr::LOCALHOST), preferred, max_attempts)
}

/// Find a bindable port on `host`, trying at most `max_attempts` candidates.
///
/// Candidates never wrap past 65535; a range that runs off the end is simply
/// shorter. Port 0 is passed through so the OS can choose.
///
/// # Errors
///
/// Returns [`NoFreePortError`] when every candidate is occupied.
pub fn allocate_on(host: IpAddr, preferred: u16, max_attempts: u16) -> Result<u16, NoFreePortError> {
    let mut last = preferred;
    let mut tried = 0u16;

    for offset in 0..max_attempts {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        last = port;
        tried += 1;

        match probe(SocketAddr::new(host, port)) {
            Ok(()) => return Ok(port),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }

    Err(NoFreePortError {
        preferred,
        last,
        attempts: tried,
    })
}

/// Bind and immediately release a socket on `addr`.
fn probe(addr: SocketAddr) -> io::Result<()> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)
}
