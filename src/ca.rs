//! Certificate Authority (CA) for TLS interception
//!
//! The root pair is loaded from disk at startup; leaf certificates are issued
//! per hostname on first use and cached for the life of the process, so every
//! connection to the same host sees the same identity.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::ServerConfig;

/// Leaf validity period in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root validity period in days (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// File name of the root certificate written by [`CertificateAuthority::generate`].
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name of the root key written by [`CertificateAuthority::generate`].
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// A host certificate signed by the root, with its private key.
pub struct LeafCertificate {
  /// chain: [leaf, root]
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// The certificate chain presented to clients, leaf first.
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// The leaf's private key.
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }

  /// A rustls server configuration presenting this certificate.
  pub fn server_config(&self, alpn_protocols: &[&[u8]]) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(crate::tls::crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::ca(format!("Failed to create TLS config: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(self.chain.clone(), self.key.clone_key())
      .map_err(|e| Error::ca(format!("Failed to create TLS config: {}", e)))?;
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();
    Ok(config)
  }
}

impl fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("chain_len", &self.chain.len())
      .finish_non_exhaustive()
  }
}

/// Certificate Authority issuing per-host leaf certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
  /// Issued leaves; entries never expire
  leaf_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateAuthority {
  /// Load the root certificate and key from PEM files.
  ///
  /// Missing or malformed material is a [`Error::Ca`]; without a root no
  /// interception is possible.
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::ca(format!(
        "Failed to read CA certificate {}: {}",
        cert_path.display(),
        e
      ))
    })?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::ca(format!("Failed to read CA key {}: {}", key_path.display(), e)))?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the authority from PEM encoded root certificate and key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::ca(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("Failed to create issuer from CA cert: {}", e)))?;

    // Parse PEM to DER for rustls
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca("No certificate found in PEM"))?
      .map_err(|e| Error::ca(format!("Failed to parse PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      leaf_cache: Cache::builder().build(),
    })
  }

  /// Generate a new root pair, write it to `dir` as [`CA_CERT_FILE`] and
  /// [`CA_KEY_FILE`], and return the authority built from it.
  pub async fn generate(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).await?;
    let (cert_pem, key_pem) = Self::generate_root_pem()?;
    fs::write(dir.join(CA_CERT_FILE), cert_pem.as_bytes()).await?;
    fs::write(dir.join(CA_KEY_FILE), key_pem.as_bytes()).await?;
    tracing::info!("wrote new root certificate to {}", dir.display());
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Generate a self-signed root, returned as `(certificate PEM, key PEM)`.
  pub fn generate_root_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "flowtap interception CA");
    dn.push(DnType::OrganizationName, "flowtap");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca(format!("Failed to generate CA: {}", e)))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Return the leaf for `hostname`, issuing and caching it on first use.
  ///
  /// Concurrent first requests for the same hostname share one issuance.
  pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let hostname = normalize_hostname(hostname);
    if hostname.is_empty() {
      return Err(Error::ca("cannot issue a certificate for an empty hostname"));
    }
    self
      .leaf_cache
      .try_get_with(hostname.clone(), async {
        tracing::debug!("issuing leaf certificate for {}", hostname);
        self.sign_leaf(&hostname).map(Arc::new)
      })
      .await
      .map_err(|e| match e.as_ref() {
        Error::Ca(reason) => Error::Ca(reason.clone()),
        other => Error::Ca(other.to_string()),
      })
  }

  fn sign_leaf(&self, hostname: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();

    // Generate random serial number for uniqueness
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an IP SAN plus a textual DNS SAN; some clients check one, some the other.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::ca(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::ca(format!("Failed to sign leaf for {}: {}", hostname, e)))?;

    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok(LeafCertificate {
      chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
      key,
    })
  }

  /// The root certificate in PEM format, for installation in client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// The root certificate in DER format.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// Default root file locations inside `dir`.
pub fn root_paths(dir: impl AsRef<Path>) -> (PathBuf, PathBuf) {
  let dir = dir.as_ref();
  (dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE))
}

fn normalize_hostname(hostname: &str) -> String {
  let hostname = hostname.trim().trim_end_matches('.');
  let hostname = hostname
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(hostname);
  hostname.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn authority() -> CertificateAuthority {
    let (cert, key) = CertificateAuthority::generate_root_pem().unwrap();
    CertificateAuthority::from_pem(&cert, &key).unwrap()
  }

  #[tokio::test]
  async fn repeated_issue_is_byte_identical() {
    let ca = authority();
    let first = ca.issue_leaf("clubhouse.pubnub.com").await.unwrap();
    let second = ca.issue_leaf("Clubhouse.PubNub.com.").await.unwrap();
    assert_eq!(first.cert_chain(), second.cert_chain());
    assert_eq!(first.key().secret_der(), second.key().secret_der());
  }

  #[tokio::test]
  async fn distinct_hosts_get_distinct_leaves() {
    let ca = authority();
    let a = ca.issue_leaf("a.example.com").await.unwrap();
    let b = ca.issue_leaf("b.example.com").await.unwrap();
    assert_ne!(a.cert_chain()[0], b.cert_chain()[0]);
    assert_eq!(a.cert_chain()[1], *ca.ca_cert_der());
  }

  #[tokio::test]
  async fn concurrent_first_requests_issue_once() {
    let ca = Arc::new(authority());
    let mut handles = Vec::new();
    for _ in 0..8 {
      let ca = ca.clone();
      handles.push(tokio::spawn(async move {
        ca.issue_leaf("race.example.com").await.unwrap()
      }));
    }
    let mut leaves = Vec::new();
    for handle in handles {
      leaves.push(handle.await.unwrap());
    }
    for leaf in &leaves[1..] {
      assert!(Arc::ptr_eq(&leaves[0], leaf));
    }
  }

  #[tokio::test]
  async fn ip_literal_and_server_config() {
    let ca = authority();
    let leaf = ca.issue_leaf("127.0.0.1").await.unwrap();
    assert_eq!(leaf.cert_chain().len(), 2);
    assert!(leaf.server_config(&[crate::tls::ALPN_HTTP_11]).is_ok());
  }

  #[tokio::test]
  async fn invalid_hostname_error_is_not_rewrapped() {
    let ca = authority();
    let err = ca.issue_leaf("bücher.example").await.err().unwrap();
    assert!(matches!(err, Error::Ca(_)));
    assert_eq!(err.to_string(), "CA error: Invalid domain name: bücher.example");
  }

  #[tokio::test]
  async fn missing_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = root_paths(dir.path());
    let err = CertificateAuthority::load(&cert, &key).await.err().unwrap();
    assert!(matches!(err, Error::Ca(_)));
  }

  #[tokio::test]
  async fn malformed_root_is_fatal() {
    let err = CertificateAuthority::from_pem("not a cert", "not a key").err().unwrap();
    assert!(matches!(err, Error::Ca(_)));
  }

  #[tokio::test]
  async fn generated_root_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let generated = CertificateAuthority::generate(dir.path()).await.unwrap();
    let (cert, key) = root_paths(dir.path());
    let loaded = CertificateAuthority::load(&cert, &key).await.unwrap();
    assert_eq!(generated.ca_cert_der(), loaded.ca_cert_der());
    assert!(loaded.ca_cert_pem().contains("BEGIN CERTIFICATE"));
  }
}
