//! Certificate authority for TLS interception.
//!
//! The CA lives in the proxy's certificate directory so that a browser which
//! trusted it once keeps trusting it across restarts:
//!
//! ```text
//! <cert_dir>/            0700
//! ├── ca.crt             PEM certificate, install this in the client
//! └── ca.key             PEM private key, 0600
//! ```
//!
//! Missing, unreadable or nearly expired material is replaced with a fresh CA.
//!
//! # Example
//!
//! ```ignore
//! use tankbot::proxy::CertificateAuthority;
//!
//! let ca = CertificateAuthority::load_or_generate(Path::new(".mitm_certs"))?;
//! println!("trust {}", ca.cert_path().display());
//! let leaf = ca.issue("game.example.com")?;
//! ```

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use x509_parser::pem::parse_x509_pem;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// CA certificate file name inside the certificate directory.
pub const CA_CERT_FILE: &str = "ca.crt";
/// CA key file name inside the certificate directory.
pub const CA_KEY_FILE: &str = "ca.key";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 30;
/// Regenerate the CA when it expires within this many days.
const CA_RENEW_DAYS: i64 = 1;

const CA_COMMON_NAME: &str = "tankbot interception CA";
const CA_ORGANIZATION: &str = "tankbot";

/// CA used to sign per-host leaf certificates.
pub struct CertificateAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    not_after: OffsetDateTime,
    cert_pem: String,
}

/// Leaf certificate issued for one host.
pub struct HostCertificate {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a new one if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or the new material
    /// cannot be generated or written. Unreadable existing material is
    /// replaced, not reported.
    pub fn load_or_generate(dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(dir).map_err(|source| CaError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(CaError::Permissions)?;

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            match Self::load(&cert_path, &key_path) {
                Ok(ca) if !ca.expires_within(Duration::days(CA_RENEW_DAYS)) => {
                    debug!("Loaded CA from {:?}", cert_path);
                    return Ok(ca);
                }
                Ok(_) => info!("CA at {:?} is about to expire, regenerating", cert_path),
                Err(e) => warn!("Ignoring unusable CA at {:?}: {}", cert_path, e),
            }
        }

        Self::generate(cert_path, key_path)
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let not_after = not_after(&cert_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            issuer,
            not_after,
            cert_pem,
        })
    }

    fn generate(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, CaError> {
        info!("Generating interception CA in {:?}", cert_path.parent());

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(CA_COMMON_NAME.to_string()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(CA_ORGANIZATION.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;
        let cert_pem = cert.pem();

        fs::write(&cert_path, &cert_pem).map_err(CaError::WriteFile)?;
        write_restricted_file(&key_path, &key_pair.serialize_pem())?;

        debug!("CA written: cert={:?}, key={:?}", cert_path, key_path);

        // Same issuer path as a reload.
        let not_after = not_after(&cert_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            cert_path,
            key_path,
            issuer,
            not_after,
            cert_pem,
        })
    }

    /// Path of the CA certificate clients must trust.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path of the CA private key.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// CA certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Expiry of the CA certificate.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    fn expires_within(&self, margin: Duration) -> bool {
        self.not_after <= OffsetDateTime::now_utc() + margin
    }

    /// Issue a leaf certificate for `host` (DNS name or IP address).
    ///
    /// # Errors
    ///
    /// Returns error if `host` is not a valid subject or signing fails.
    pub fn issue(&self, host: &str) -> Result<HostCertificate, CaError> {
        debug!("Issuing certificate for {}", host);

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::InvalidDomain(host.to_string()))?,
            ),
        };

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(HostCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Expiry recorded in a PEM certificate.
fn not_after(cert_pem: &str) -> Result<OffsetDateTime, CaError> {
    let (_, pem) =
        parse_x509_pem(cert_pem.as_bytes()).map_err(|e| CaError::Parse(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| CaError::Parse(e.to_string()))?;
    let timestamp = cert.validity().not_after.timestamp();
    OffsetDateTime::from_unix_timestamp(timestamp).map_err(|e| CaError::Parse(e.to_string()))
}

fn read(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).map_err(|source| CaError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CaError::WriteFile)?;

    file.write_all(content.as_bytes())
        .map_err(CaError::WriteFile)?;

    Ok(())
}
