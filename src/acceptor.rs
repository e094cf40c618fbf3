//! Listening socket and original-destination recovery.

use crate::errors::{Error, Result};
use crate::request::split_host_port;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream, ToSocketAddrs};

/// Where an intercepted connection was headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  host: String,
  port: u16,
}

impl Destination {
  /// A destination from a host name or IP literal and a port.
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Host name or IP literal, without brackets.
  pub fn host(&self) -> &str {
    &self.host
  }

  /// TCP port.
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Returns true if the host is an IP literal rather than a name.
  pub fn is_ip(&self) -> bool {
    self.host.parse::<IpAddr>().is_ok()
  }

  /// Resolve to the first socket address.
  pub async fn resolve(&self) -> Result<SocketAddr> {
    lookup_host((self.host.as_str(), self.port))
      .await
      .map_err(Error::Forward)?
      .next()
      .ok_or_else(|| {
        Error::Forward(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          format!("no address for {}", self),
        ))
      })
  }
}

impl From<SocketAddr> for Destination {
  fn from(addr: SocketAddr) -> Self {
    Self::new(addr.ip().to_string(), addr.port())
  }
}

impl FromStr for Destination {
  type Err = Error;

  /// Parse `host:port`; IPv6 literals must be bracketed.
  fn from_str(s: &str) -> Result<Self> {
    match split_host_port(s.trim()) {
      (host, Some(port)) if !host.is_empty() => Ok(Self::new(host, port)),
      _ => Err(Error::config(format!("expected host:port, got `{}`", s))),
    }
  }
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Recovers the original destination of a redirected connection.
///
/// `None` means unknown; the caller then falls back to what the traffic itself says.
pub trait DestinationLookup: Send + Sync {
  /// Look up the destination of `stream`, accepted on `local`.
  fn lookup(&self, stream: &TcpStream, local: SocketAddr) -> Option<Destination>;
}

/// `SO_ORIGINAL_DST`, as set by an iptables `REDIRECT` rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoOriginalDst;

impl DestinationLookup for SoOriginalDst {
  #[cfg(any(target_os = "linux", target_os = "android"))]
  fn lookup(&self, stream: &TcpStream, local: SocketAddr) -> Option<Destination> {
    let sock = socket2::SockRef::from(stream);
    let original = if local.is_ipv6() {
      sock.original_dst_ipv6()
    } else {
      sock.original_dst()
    };
    match original.ok().and_then(|addr| addr.as_socket()) {
      // without a redirect rule the kernel reports the listener itself
      Some(addr) if addr == local => None,
      Some(addr) => Some(Destination::from(addr)),
      None => None,
    }
  }

  #[cfg(not(any(target_os = "linux", target_os = "android")))]
  fn lookup(&self, _stream: &TcpStream, _local: SocketAddr) -> Option<Destination> {
    None
  }
}

/// Every connection goes to one configured upstream.
#[derive(Debug, Clone)]
pub struct FixedUpstream(pub Destination);

impl DestinationLookup for FixedUpstream {
  fn lookup(&self, _stream: &TcpStream, _local: SocketAddr) -> Option<Destination> {
    Some(self.0.clone())
  }
}

/// Original destination when the platform knows it, else an optional fixed upstream.
#[derive(Debug, Clone, Default)]
pub struct Transparent {
  upstream: Option<Destination>,
}

impl Transparent {
  /// Fall back to `upstream` when the original destination is unknown.
  pub fn new(upstream: Option<Destination>) -> Self {
    Self { upstream }
  }
}

impl DestinationLookup for Transparent {
  fn lookup(&self, stream: &TcpStream, local: SocketAddr) -> Option<Destination> {
    SoOriginalDst
      .lookup(stream, local)
      .or_else(|| self.upstream.clone())
  }
}

/// An accepted client connection, before any TLS or HTTP processing.
#[derive(Debug)]
pub struct Connection {
  id: u64,
  stream: TcpStream,
  peer_addr: SocketAddr,
  local_addr: SocketAddr,
  destination: Option<Destination>,
}

impl Connection {
  /// Process-unique connection number.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// The client's address.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }
  /// The listener address the client reached.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
  /// The recovered destination, if known.
  pub fn destination(&self) -> Option<&Destination> {
    self.destination.as_ref()
  }
  /// The raw client stream.
  pub fn stream(&self) -> &TcpStream {
    &self.stream
  }
  /// Give up the stream to the interception stage.
  pub fn into_stream(self) -> TcpStream {
    self.stream
  }
}

/// Accepts redirected connections and tags them with their destination.
pub struct Acceptor {
  listener: TcpListener,
  lookup: Arc<dyn DestinationLookup>,
  next_id: AtomicU64,
}

impl Acceptor {
  /// Bind the listening socket.
  pub async fn bind(addr: impl ToSocketAddrs, lookup: Arc<dyn DestinationLookup>) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self::from_listener(listener, lookup))
  }

  /// Wrap an already bound listener.
  pub fn from_listener(listener: TcpListener, lookup: Arc<dyn DestinationLookup>) -> Self {
    Self {
      listener,
      lookup,
      next_id: AtomicU64::new(1),
    }
  }

  /// The bound address.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Wait for the next connection.
  ///
  /// A failure concerns only the connection being accepted; the listener stays usable.
  pub async fn accept(&self) -> Result<Connection> {
    let (stream, peer_addr) = self.listener.accept().await.map_err(Error::Accept)?;
    let local_addr = stream.local_addr().map_err(Error::Accept)?;
    let destination = self.lookup.lookup(&stream, local_addr);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
      connection = id,
      peer = %peer_addr,
      destination = ?destination,
      "accepted connection"
    );
    Ok(Connection {
      id,
      stream,
      peer_addr,
      local_addr,
      destination,
    })
  }
}
