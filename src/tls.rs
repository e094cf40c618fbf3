//! TLS interception: the client-facing handshake with a CA-issued leaf and
//! the origin-facing handshake with a real trust store.

use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::socket::Socket;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  RootCertStore, SignatureScheme,
};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

/// Content type of a TLS handshake record, the first byte of every ClientHello.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Only HTTP/1.1 is intercepted; both legs advertise it alone.
pub const ALPN_HTTP_11: &[u8] = b"http/1.1";

/// How the origin's certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginVerification {
  /// Chain must verify against the platform roots plus configured extras.
  #[default]
  Strict,
  /// Any certificate is accepted.
  Permissive,
}

/// The crypto provider installed for the process, else ring.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Peek at the first byte without consuming it and report whether the client
/// is opening a TLS session.
pub async fn is_tls_client_hello(stream: &TcpStream) -> std::io::Result<bool> {
  let mut first = [0u8; 1];
  let n = stream.peek(&mut first).await?;
  Ok(n == 1 && first[0] == TLS_HANDSHAKE_RECORD)
}

/// Read every certificate of a PEM bundle.
pub fn load_pem_roots(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
  let path = path.as_ref();
  let pem = std::fs::read(path)
    .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
  rustls_pemfile::certs(&mut pem.as_slice())
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::config(format!("invalid certificate in {}: {}", path.display(), e)))
}

/// Terminates client TLS with forged leaves and opens origin TLS sessions.
#[derive(Clone)]
pub struct TlsInterceptor {
  ca: Arc<CertificateAuthority>,
  connector: TlsConnector,
}

impl TlsInterceptor {
  /// Build an interceptor issuing leaves from `ca` and checking origins per `verification`.
  ///
  /// `extra_roots` are trusted in addition to the platform store under strict verification.
  pub fn new(
    ca: Arc<CertificateAuthority>,
    verification: OriginVerification,
    extra_roots: Vec<CertificateDer<'static>>,
  ) -> Result<Self> {
    let config_builder = ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::config(format!("invalid TLS versions: {}", e)))?;
    let mut config = match verification {
      OriginVerification::Permissive => config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth(),
      OriginVerification::Strict => {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
          tracing::warn!("skipping platform root store entry: {}", e);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::debug!("loaded {} platform roots ({} ignored)", added, ignored);
        for cert in extra_roots {
          roots
            .add(cert)
            .map_err(|e| Error::config(format!("invalid extra root: {}", e)))?;
        }
        config_builder
          .with_root_certificates(roots)
          .with_no_client_auth()
      }
    };
    config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
    Ok(Self {
      ca,
      connector: TlsConnector::from(Arc::new(config)),
    })
  }

  /// The authority issuing leaves.
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Complete the client handshake.
  ///
  /// The leaf is chosen from the SNI the client sent, falling back to
  /// `fallback_host` (the recovered destination). Returns the TLS session and
  /// the host name the origin leg should use.
  pub async fn intercept(
    &self,
    stream: TcpStream,
    fallback_host: Option<&str>,
  ) -> Result<(Socket, String)> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor
      .await
      .map_err(|e| Error::tls_handshake(format!("reading client hello: {}", e)))?;
    let host = match start.client_hello().server_name() {
      Some(sni) => sni.to_string(),
      None => fallback_host
        .map(str::to_string)
        .ok_or_else(|| Error::tls_handshake("client sent no SNI and destination is unknown"))?,
    };
    let leaf = self.ca.issue_leaf(&host).await?;
    let config = leaf.server_config(&[ALPN_HTTP_11])?;
    let tls = start
      .into_stream(Arc::new(config))
      .await
      .map_err(|e| Error::tls_handshake(format!("client handshake for {}: {}", host, e)))?;
    tracing::debug!("client TLS established for {}", host);
    Ok((Socket::from(tls), host))
  }

  /// Dial `addr` and perform a client handshake presenting `host` as SNI and
  /// verifying the origin certificate against it.
  pub async fn connect_origin(&self, addr: SocketAddr, host: &str) -> Result<Socket> {
    let stream = TcpStream::connect(addr).await.map_err(Error::Forward)?;
    self.handshake_origin(stream, host).await
  }

  /// Handshake over an already connected origin stream.
  pub async fn handshake_origin(&self, stream: TcpStream, host: &str) -> Result<Socket> {
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|e| Error::tls_handshake(format!("invalid origin name {}: {}", host, e)))?;
    let tls = self
      .connector
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::tls_handshake(format!("origin handshake with {}: {}", host, e)))?;
    Ok(Socket::from(tls))
  }
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn detects_client_hello_by_first_byte() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tls_client = tokio::spawn(async move {
      let mut s = TcpStream::connect(addr).await.unwrap();
      s.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
      s
    });
    let (tls_side, _) = listener.accept().await.unwrap();
    let _keep = tls_client.await.unwrap();
    assert!(is_tls_client_hello(&tls_side).await.unwrap());

    let plain_client = tokio::spawn(async move {
      let mut s = TcpStream::connect(addr).await.unwrap();
      s.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
      s
    });
    let (plain_side, _) = listener.accept().await.unwrap();
    let _keep = plain_client.await.unwrap();
    assert!(!is_tls_client_hello(&plain_side).await.unwrap());
  }

  #[test]
  fn verification_mode_names() {
    #[derive(Deserialize)]
    struct Wrapper {
      verify: OriginVerification,
    }
    let w: Wrapper = toml::from_str("verify = \"permissive\"").unwrap();
    assert_eq!(w.verify, OriginVerification::Permissive);
  }
}
