//! Proxy configuration loaded from TOML.

use crate::acceptor::Destination;
use crate::errors::{Error, Result};
use crate::tls::OriginVerification;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hosts whose traffic the reference logger records by default.
pub const DEFAULT_LOG_HOSTS: [&str; 3] = [
  "clubhouse.pubnub.com",
  "clubhouse.pubnubapi.com",
  "www.clubhouseapi.com",
];

/// Main proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Listening socket for redirected traffic
  pub listen: SocketAddr,
  /// Fixed destination used when the original one cannot be recovered (`host:port`)
  pub upstream: Option<String>,
  /// Close a connection after this many idle seconds between requests; 0 disables
  pub idle_timeout_secs: u64,
  /// Give up on a write to either peer after this many seconds; 0 disables
  pub write_timeout_secs: u64,
  /// Root CA material
  pub ca: CaConfig,
  /// Origin certificate checking
  pub origin_tls: OriginTlsConfig,
  /// Reference JSON logger
  pub log: LogConfig,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
      upstream: None,
      idle_timeout_secs: 0,
      write_timeout_secs: 0,
      ca: CaConfig::default(),
      origin_tls: OriginTlsConfig::default(),
      log: LogConfig::default(),
    }
  }
}

/// Root certificate and key locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
  /// PEM root certificate
  pub cert: PathBuf,
  /// PEM root private key
  pub key: PathBuf,
}

impl Default for CaConfig {
  fn default() -> Self {
    let (cert, key) = crate::ca::root_paths("ca");
    Self { cert, key }
  }
}

/// How origin certificates are verified
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginTlsConfig {
  /// `strict` or `permissive`
  pub verify: OriginVerification,
  /// PEM bundle trusted in addition to the platform roots
  pub extra_roots: Option<PathBuf>,
}

/// Reference logger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Register the logger at all
  pub enabled: bool,
  /// Append-only record file
  pub path: PathBuf,
  /// Request hosts whose exchanges are recorded
  pub hosts: Vec<String>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: PathBuf::from("/var/log/mitmproxy.log"),
      hosts: DEFAULT_LOG_HOSTS.iter().map(|h| h.to_string()).collect(),
    }
  }
}

impl ProxyConfig {
  /// Load configuration from a TOML file
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("Failed to read config file {:?}: {}", path, e)))?;
    let config = Self::from_toml(&content)
      .map_err(|e| Error::config(format!("Failed to parse config file {:?}: {}", path, e)))?;
    tracing::debug!("loaded configuration from {:?}", path);
    Ok(config)
  }

  /// Parse and validate TOML text.
  pub fn from_toml(content: &str) -> Result<Self> {
    let config: ProxyConfig = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Check values serde cannot check.
  pub fn validate(&self) -> Result<()> {
    self.upstream()?;
    if self.log.enabled && self.log.hosts.iter().any(|h| h.trim().is_empty()) {
      return Err(Error::Config("log.hosts contains an empty host".to_string()));
    }
    Ok(())
  }

  /// The fixed upstream, parsed.
  pub fn upstream(&self) -> Result<Option<Destination>> {
    self
      .upstream
      .as_deref()
      .map(|s| s.parse::<Destination>())
      .transpose()
  }

  /// The per-connection idle timeout, if enabled.
  pub fn idle_timeout(&self) -> Option<Duration> {
    (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
  }

  /// The per-write timeout, if enabled.
  pub fn write_timeout(&self) -> Option<Duration> {
    (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs))
  }
}
