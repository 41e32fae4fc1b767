//! TLS termination on both sides of an intercepted tunnel.
//!
//! - [`CertificateCache`] issues and caches per-host leaf certificates
//! - [`HostCertResolver`] picks the leaf by SNI, falling back to the CONNECT host
//! - [`TlsInterceptor`] bundles the client-facing acceptor and the upstream connector
//!
//! Both sides are pinned to `http/1.1` through ALPN. A WebSocket upgrade is an
//! HTTP/1.1 mechanism, and the relay copies bytes without understanding h2.

use super::ca::CertificateAuthority;
use super::error::{ProxyError, ProxyResult};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace, warn};

/// Cached leaves before the cache is flushed.
const MAX_CACHED_HOSTS: usize = 1024;

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Per-host leaf certificates signed by the interception CA.
pub struct CertificateCache {
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    ca: Arc<CertificateAuthority>,
}

impl CertificateCache {
    /// Create an empty cache issuing from `ca`.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Return the cached leaf for `host`, issuing one on a miss.
    ///
    /// Host names are compared case-insensitively.
    pub fn get_or_issue(&self, host: &str) -> ProxyResult<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();

        if let Some(key) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host)
        {
            trace!("Certificate cache hit for {}", host);
            return Ok(key.clone());
        }

        let leaf = self.ca.issue(&host)?;

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;
        if chain.is_empty() {
            return Err(ProxyError::Tls("No certificates found in PEM".into()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= MAX_CACHED_HOSTS {
            debug!("Certificate cache full, flushing {} entries", cache.len());
            cache.clear();
        }
        cache.insert(host, certified.clone());

        Ok(certified)
    }

    /// Number of cached leaves.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been issued yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves the server certificate for one intercepted tunnel.
pub struct HostCertResolver {
    cache: Arc<CertificateCache>,
    connect_host: String,
}

impl HostCertResolver {
    /// Resolver for a tunnel opened with `CONNECT connect_host:port`.
    pub fn new(cache: Arc<CertificateCache>, connect_host: String) -> Self {
        Self { cache, connect_host }
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.connect_host.as_str());

        match self.cache.get_or_issue(host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", host, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertResolver")
            .field("connect_host", &self.connect_host)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// TLS material for intercepting tunnels, built once per listener.
pub struct TlsInterceptor {
    certs: Arc<CertificateCache>,
    connector: TlsConnector,
}

impl TlsInterceptor {
    /// Build the interceptor from a loaded CA and the system trust roots.
    ///
    /// A host without trust roots still starts; upstream handshakes then fail
    /// per connection.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            certs: Arc::new(CertificateCache::new(ca)),
            connector: upstream_connector(),
        }
    }

    /// Acceptor presenting a leaf for `connect_host` (or the client's SNI).
    pub fn acceptor(&self, connect_host: &str) -> TlsAcceptor {
        let resolver = Arc::new(HostCertResolver::new(self.certs.clone(), connect_host.to_string()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }

    /// Connector for the origin side.
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Leaf certificate cache.
    pub fn certificates(&self) -> &CertificateCache {
        &self.certs
    }
}

fn upstream_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        debug!("Warning loading native cert: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        debug!("Ignored {} unparsable root certificates", ignored);
    }
    if added == 0 {
        warn!("No system root certificates found; upstream TLS will fail");
    } else {
        debug!("Loaded {} root certificates", added);
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    TlsConnector::from(Arc::new(config))
}

/// Convert a host to a TLS server name (DNS name or IP address).
pub fn server_name(host: &str) -> ProxyResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))
}
