//! Accept loop and the per-connection interception pipeline.

use crate::acceptor::{Acceptor, Connection, Destination, Transparent};
use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::flow::{ClientConn, Flow, FlowId};
use crate::forward::Forwarder;
use crate::hooks::{Control, Event, HookRegistry};
use crate::parser::{Framing, MessageReader, Parsed};
use crate::record::{JsonLogHook, JSON_LOG_HOOK};
use crate::socket::Socket;
use crate::tls::{is_tls_client_hello, load_pem_roots, TlsInterceptor};
use crate::{Request, Response};
use http::uri::Scheme;
use http::{Method, StatusCode};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// The hooks a configured deployment runs: the JSON logger when `[log]` enables it.
pub fn default_hooks(config: &ProxyConfig) -> HookRegistry {
  let mut hooks = HookRegistry::new();
  if config.log.enabled {
    hooks.register(
      Event::Response,
      JSON_LOG_HOOK,
      Arc::new(JsonLogHook::from_config(&config.log)),
    );
  }
  hooks
}

/// Proxy server implementation
pub struct ProxyServer {
  acceptor: Acceptor,
  interceptor: TlsInterceptor,
  hooks: HookRegistry,
  forwarder: Forwarder,
  idle_timeout: Option<Duration>,
}

/// State every connection handler reads; nothing here is mutated after start.
struct Shared {
  interceptor: TlsInterceptor,
  hooks: HookRegistry,
  forwarder: Forwarder,
  idle_timeout: Option<Duration>,
}

impl ProxyServer {
  /// Assemble a server from its parts. Hooks must be registered before this point.
  pub fn new(acceptor: Acceptor, interceptor: TlsInterceptor, hooks: HookRegistry) -> Self {
    Self {
      acceptor,
      interceptor,
      hooks,
      forwarder: Forwarder::default(),
      idle_timeout: None,
    }
  }

  /// Close client connections idle for longer than `timeout` between requests.
  pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.idle_timeout = timeout;
    self
  }

  /// Replace the forwarder.
  pub fn forwarder(mut self, forwarder: Forwarder) -> Self {
    self.forwarder = forwarder;
    self
  }

  /// Load the CA, build the TLS stack and bind the listener as `config` says.
  ///
  /// Missing CA material and an unusable listening address are startup errors.
  pub async fn from_config(config: &ProxyConfig, hooks: HookRegistry) -> Result<Self> {
    let ca = CertificateAuthority::load(&config.ca.cert, &config.ca.key).await?;
    let extra_roots = match &config.origin_tls.extra_roots {
      Some(path) => load_pem_roots(path)?,
      None => Vec::new(),
    };
    let interceptor = TlsInterceptor::new(Arc::new(ca), config.origin_tls.verify, extra_roots)?;
    let lookup = Arc::new(Transparent::new(config.upstream()?));
    let acceptor = Acceptor::bind(config.listen, lookup).await?;
    Ok(
      Self::new(acceptor, interceptor, hooks)
        .idle_timeout(config.idle_timeout())
        .forwarder(Forwarder::new(config.write_timeout())),
    )
  }

  /// The bound listening address.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.acceptor.local_addr()
  }

  /// Run the proxy server
  pub async fn run(self) -> Result<()> {
    self.run_until(std::future::pending()).await
  }

  /// Run until `shutdown` completes. Connections already accepted keep running.
  pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
    let ProxyServer {
      acceptor,
      interceptor,
      hooks,
      forwarder,
      idle_timeout,
    } = self;
    let shared = Arc::new(Shared {
      interceptor,
      hooks,
      forwarder,
      idle_timeout,
    });
    tracing::info!("listening on {}", acceptor.local_addr()?);
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          tracing::info!("shutting down listener");
          return Ok(());
        }
        accepted = acceptor.accept() => match accepted {
          Ok(conn) => {
            tokio::spawn(handle_connection(shared.clone(), conn));
          }
          Err(e) => {
            tracing::error!("failed to accept connection: {}", e);
          }
        }
      }
    }
  }
}

async fn handle_connection(shared: Arc<Shared>, conn: Connection) {
  let id = conn.id();
  let peer = conn.peer_addr();
  match serve(shared, conn).await {
    Ok(()) => tracing::debug!(connection = id, %peer, "connection closed"),
    Err(e) => tracing::info!(connection = id, %peer, "connection closed: {}", e),
  }
}

/// Detect TLS, establish both legs, then run the HTTP pipeline.
///
/// With an idle timeout set, the same limit bounds the whole setup phase.
async fn serve(shared: Arc<Shared>, conn: Connection) -> Result<()> {
  let mut session = match shared.idle_timeout {
    None => establish(shared.clone(), conn).await?,
    Some(timeout) => tokio::time::timeout(timeout, establish(shared.clone(), conn))
      .await
      .map_err(|_| {
        Error::Io(io::Error::new(
          io::ErrorKind::TimedOut,
          "connection setup timed out",
        ))
      })??,
  };

  match session.run().await? {
    Ending::Upgraded => session.relay().await,
    Ending::Closed => {
      session.shutdown().await;
      Ok(())
    }
  }
}

async fn establish(shared: Arc<Shared>, conn: Connection) -> Result<Session> {
  let id = conn.id();
  let peer_addr = conn.peer_addr();
  let destination = conn.destination().cloned();
  let stream = conn.into_stream();

  let session = if is_tls_client_hello(&stream).await? {
    let fallback = destination.as_ref().map(|d| d.host().to_string());
    let (client, host) = shared
      .interceptor
      .intercept(stream, fallback.as_deref())
      .await?;
    let target = destination.unwrap_or_else(|| Destination::new(host.clone(), 443));
    let client_conn = ClientConn {
      peer_addr,
      server_name: Some(host.clone()),
    };
    let mut session = Session::new(shared, id, client_conn, client, Scheme::HTTPS);
    session.fixed_target = Some(target.clone());
    session.tls_name = Some(host);
    // both handshakes complete before any HTTP is read
    session.origin = Some(session.dial(&target).await?);
    session
  } else {
    let client_conn = ClientConn {
      peer_addr,
      server_name: None,
    };
    let mut session = Session::new(shared, id, client_conn, Socket::from(stream), Scheme::HTTP);
    session.fixed_target = destination;
    session
  };
  Ok(session)
}

enum Ending {
  Closed,
  Upgraded,
}

enum Next {
  KeepAlive,
  Close,
  Upgrade,
}

struct Origin {
  destination: Destination,
  reader: MessageReader<Socket>,
  served: u64,
}

/// One client connection and the origin connection(s) it drives.
struct Session {
  shared: Arc<Shared>,
  connection: u64,
  client_conn: ClientConn,
  client: MessageReader<Socket>,
  scheme: Scheme,
  /// the destination every request goes to; unset for plain HTTP without redirect metadata
  fixed_target: Option<Destination>,
  /// SNI for origin handshakes; set iff the client spoke TLS
  tls_name: Option<String>,
  origin: Option<Origin>,
  sequence: u64,
}

impl Session {
  fn new(
    shared: Arc<Shared>,
    connection: u64,
    client_conn: ClientConn,
    client: Socket,
    scheme: Scheme,
  ) -> Self {
    Self {
      shared,
      connection,
      client_conn,
      client: MessageReader::new(client),
      scheme,
      fixed_target: None,
      tls_name: None,
      origin: None,
      sequence: 0,
    }
  }

  async fn run(&mut self) -> Result<Ending> {
    loop {
      let parsed = match self.next_request().await {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(Ending::Closed),
        Err(e @ Error::MalformedMessage {
          recoverable: true, ..
        }) => {
          tracing::debug!(connection = self.connection, "rejecting request: {}", e);
          self.reply_bad_request().await?;
          continue;
        }
        Err(e) => return Err(e),
      };
      self.sequence += 1;
      let mut request = parsed.message;
      request.set_scheme(self.scheme.clone());
      if let Some(authority) = self.default_authority() {
        request.set_authority_if_empty(|| authority);
      }
      let id = FlowId {
        connection: self.connection,
        sequence: self.sequence,
      };
      let mut flow = Flow::new(
        id,
        request,
        self.client_conn.clone(),
        self.fixed_target.clone(),
      )
      .with_request_raw(parsed.raw);
      tracing::debug!(flow = %id, method = %flow.request.method(), url = %flow.request.url(), "request");

      match self.exchange(&mut flow).await {
        Ok(Next::KeepAlive) => {}
        Ok(Next::Close) => return Ok(Ending::Closed),
        Ok(Next::Upgrade) => return Ok(Ending::Upgraded),
        Err(e) => {
          flow.set_error(&e);
          self.shared.hooks.dispatch(Event::Error, &mut flow).await;
          if let Error::MalformedMessage {
            recoverable: true, ..
          } = e
          {
            // before forwarding the request is at fault, after it the origin's reply
            let status = if flow.timestamps().request_forwarded.is_some() {
              self.origin = None;
              StatusCode::BAD_GATEWAY
            } else {
              StatusCode::BAD_REQUEST
            };
            flow.response = Some(Response::new(status));
            self
              .shared
              .forwarder
              .forward_response(&mut flow, self.client.get_mut())
              .await?;
            if flow.request.wants_close() {
              return Ok(Ending::Closed);
            }
            continue;
          }
          return Err(e);
        }
      }
    }
  }

  async fn next_request(&mut self) -> Result<Option<Parsed<Request>>> {
    match self.shared.idle_timeout {
      None => self.client.parse_request().await,
      Some(timeout) => match tokio::time::timeout(timeout, self.client.parse_request()).await {
        Ok(parsed) => parsed,
        Err(_) => {
          tracing::debug!(connection = self.connection, "idle timeout");
          Ok(None)
        }
      },
    }
  }

  fn default_authority(&self) -> Option<String> {
    self
      .tls_name
      .clone()
      .or_else(|| self.fixed_target.as_ref().map(|d| d.to_string()))
  }

  /// Hooks, origin round trip and forwarding for one flow.
  async fn exchange(&mut self, flow: &mut Flow) -> Result<Next> {
    let mut close = flow.request.wants_close();
    match self.shared.hooks.dispatch(Event::Request, flow).await {
      Control::Drop => return Ok(Next::Close),
      Control::CloseConnection => close = true,
      Control::Continue => {}
    }

    let from_origin = flow.response.is_none();
    if from_origin {
      if self.fetch_response(flow).await? == Framing::UntilClose {
        close = true;
      }
    } else {
      tracing::debug!(flow = %flow.id(), "response supplied by request hook");
      flow.timestamps_mut().response_received = Some(SystemTime::now());
    }

    match self.shared.hooks.dispatch(Event::Response, flow).await {
      Control::Drop => return Ok(Next::Close),
      Control::CloseConnection => close = true,
      Control::Continue => {}
    }

    self
      .shared
      .forwarder
      .forward_response(flow, self.client.get_mut())
      .await?;

    let status = flow.response.as_ref().map(Response::status_code);
    if from_origin && status.is_some_and(|s| is_upgrade(flow.request.method(), s)) {
      return Ok(Next::Upgrade);
    }
    if close || flow.response.as_ref().is_some_and(Response::wants_close) {
      Ok(Next::Close)
    } else {
      Ok(Next::KeepAlive)
    }
  }

  /// Send the request upstream and read the reply into the flow.
  ///
  /// A kept-alive origin connection that turns out to be closed is redialed once.
  async fn fetch_response(&mut self, flow: &mut Flow) -> Result<Framing> {
    let target = self.target_for(flow)?;
    flow.set_origin(target.clone());
    let mut redialed = false;
    loop {
      if !self
        .origin
        .as_ref()
        .is_some_and(|o| o.destination == target)
      {
        self.origin = None;
        self.origin = Some(self.dial(&target).await?);
      }
      let reused = self.origin.as_ref().is_some_and(|o| o.served > 0);
      match self.round_trip(flow).await {
        Err(e) if reused && !redialed && is_stale(&e) => {
          tracing::debug!(flow = %flow.id(), "origin connection went stale, redialing: {}", e);
          self.origin = None;
          redialed = true;
        }
        result => return result,
      }
    }
  }

  async fn round_trip(&mut self, flow: &mut Flow) -> Result<Framing> {
    let Some(origin) = self.origin.as_mut() else {
      return Err(Error::Forward(io::Error::from(io::ErrorKind::NotConnected)));
    };
    self
      .shared
      .forwarder
      .forward_request(flow, origin.reader.get_mut())
      .await?;
    let method = flow.request.method().clone();
    let parsed = origin.reader.parse_response(&method).await?;
    origin.served += 1;
    let framing = parsed.framing;
    let keep_origin = framing != Framing::UntilClose
      && (!parsed.message.wants_close() || is_upgrade(&method, parsed.message.status_code()));
    tracing::debug!(flow = %flow.id(), status = %parsed.message.status_code(), "response");
    flow.set_response_from_wire(parsed.message, parsed.raw);
    if !keep_origin {
      self.origin = None;
    }
    Ok(framing)
  }

  fn target_for(&self, flow: &Flow) -> Result<Destination> {
    if let Some(target) = &self.fixed_target {
      return Ok(target.clone());
    }
    let host = flow.request.host();
    if host.is_empty() {
      return Err(Error::malformed_recoverable(
        "request names no host and its destination is unknown",
      ));
    }
    Ok(Destination::new(host, flow.request.port()))
  }

  async fn dial(&self, target: &Destination) -> Result<Origin> {
    let addr = target.resolve().await?;
    let socket = match &self.tls_name {
      Some(name) => self.shared.interceptor.connect_origin(addr, name).await?,
      None => Socket::from(TcpStream::connect(addr).await.map_err(Error::Forward)?),
    };
    tracing::debug!(connection = self.connection, origin = %target, "connected to origin");
    Ok(Origin {
      destination: target.clone(),
      reader: MessageReader::new(socket),
      served: 0,
    })
  }

  async fn reply_bad_request(&mut self) -> Result<()> {
    let response = Response::new(StatusCode::BAD_REQUEST).with_body("");
    let client = self.client.get_mut();
    client
      .write_all(&response.to_raw())
      .await
      .map_err(Error::Forward)?;
    client.flush().await.map_err(Error::Forward)
  }

  /// After a protocol switch, shuttle bytes both ways until either side closes.
  async fn relay(self) -> Result<()> {
    tracing::debug!(connection = self.connection, "switching to raw relay");
    let Some(origin) = self.origin else {
      return Ok(());
    };
    let (mut client, client_ahead) = self.client.into_parts();
    let (mut server, server_ahead) = origin.reader.into_parts();
    if !client_ahead.is_empty() {
      server.write_all(&client_ahead).await.map_err(Error::Forward)?;
    }
    if !server_ahead.is_empty() {
      client.write_all(&server_ahead).await.map_err(Error::Forward)?;
    }
    tokio::io::copy_bidirectional(&mut client, &mut server)
      .await
      .map_err(Error::Forward)?;
    Ok(())
  }

  async fn shutdown(&mut self) {
    if let Err(e) = self.client.get_mut().shutdown().await {
      tracing::trace!(connection = self.connection, "client shutdown: {}", e);
    }
  }
}

fn is_upgrade(method: &Method, status: StatusCode) -> bool {
  status == StatusCode::SWITCHING_PROTOCOLS || (method == Method::CONNECT && status.is_success())
}

/// Errors meaning a reused origin connection was closed before it answered.
fn is_stale(error: &Error) -> bool {
  match error {
    Error::Forward(_) => true,
    Error::Io(e) => matches!(
      e.kind(),
      io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    ),
    _ => false,
  }
}
