//! Error types for proxy operations.
//!
//! This module defines structured error types for the intercepting proxy:
//! - Lifecycle errors (port negotiation, binding)
//! - TLS errors (CA material, leaf certificates, handshakes)
//! - Connection errors (CONNECT parsing, upstream connection, upgrade)

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Every candidate port was occupied when starting.
    #[error(transparent)]
    NoFreePort(#[from] NoFreePortError),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// CA material could not be loaded or used.
    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// No candidate port in the probed range could be bound.
///
/// Returned from [`allocate`](super::ports::allocate) and surfaced
/// unchanged from [`ProxyService::start`](super::ProxyService::start).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No free port in range {preferred}-{last} ({attempts} attempts exhausted)")]
pub struct NoFreePortError {
    /// The port the caller asked for.
    pub preferred: u16,
    /// The last candidate that was probed.
    pub last: u16,
    /// How many candidates were probed.
    pub attempts: u16,
}

/// Errors from CA generation, persistence and leaf signing.
#[derive(Debug, Error)]
pub enum CaError {
    /// Certificate directory could not be created.
    #[error("Failed to create certificate directory '{path}': {source}")]
    CreateDir {
        /// Directory we tried to create.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Permissions could not be applied.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// CA certificate generation failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(String),

    /// Existing CA material could not be read.
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        /// File we tried to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// CA material could not be written.
    #[error("Failed to write CA file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// Existing CA material is not valid PEM/X.509.
    #[error("Failed to parse CA material: {0}")]
    Parse(String),

    /// Leaf certificate signing failed.
    #[error("Certificate signing failed: {0}")]
    Signing(String),

    /// Host name is not usable as a certificate subject.
    #[error("Invalid domain '{0}'")]
    InvalidDomain(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::InvalidConnect("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_upstream_connect_error() {
        let err = ProxyError::UpstreamConnect {
            addr: "game.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("game.example.com:443"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_no_free_port_message_names_range() {
        let err = NoFreePortError {
            preferred: 9000,
            last: 9001,
            attempts: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("9000-9001"));
        assert!(msg.contains("2 attempts"));

        let proxy_err: ProxyError = err.clone().into();
        assert_eq!(proxy_err.to_string(), err.to_string());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }

    #[test]
    fn test_ca_error_conversion() {
        let err: ProxyError = CaError::InvalidDomain("bad host".to_string()).into();
        assert!(matches!(err, ProxyError::Ca(CaError::InvalidDomain(_))));
        assert!(err.to_string().contains("bad host"));
    }
}
