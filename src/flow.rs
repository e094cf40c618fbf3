//! One request/response exchange as it moves through the hook pipeline.

use crate::acceptor::Destination;
use crate::hooks::Event;
use crate::{Request, Response};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Identifies a flow: the connection it arrived on and its position there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
  /// connection number assigned by the acceptor
  pub connection: u64,
  /// 1-based index of the exchange on that connection
  pub sequence: u64,
}

impl fmt::Display for FlowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.connection, self.sequence)
  }
}

/// Wall-clock milestones of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
  /// the request was fully read from the client
  pub request_received: SystemTime,
  /// the request was written to the origin
  pub request_forwarded: Option<SystemTime>,
  /// the response was fully read (or produced by a hook)
  pub response_received: Option<SystemTime>,
  /// the response was written to the client
  pub response_forwarded: Option<SystemTime>,
}

/// A hook that returned an error while handling this flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
  /// registration name of the hook
  pub hook: String,
  /// the event being dispatched
  pub event: Event,
  /// rendered error
  pub message: String,
}

/// The client side of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConn {
  /// the client's address
  pub peer_addr: SocketAddr,
  /// SNI the client sent, if it spoke TLS
  pub server_name: Option<String>,
}

/// A message as it came off the wire, kept so an untouched message can be
/// relayed byte for byte.
#[derive(Debug, Clone)]
pub(crate) struct Wire<T> {
  pub(crate) original: T,
  pub(crate) raw: Bytes,
}

/// One request paired with its eventual response.
///
/// Hooks receive `&mut Flow` and may edit `request` and `response` in place;
/// edits are visible to later hooks and to the forwarder.
#[derive(Debug, Clone)]
pub struct Flow {
  id: FlowId,
  /// the client's request
  pub request: Request,
  /// the response, once received or produced by a request hook
  pub response: Option<Response>,
  client: ClientConn,
  origin: Option<Destination>,
  error: Option<String>,
  hook_failures: Vec<HookFailure>,
  timestamps: Timestamps,
  pub(crate) request_wire: Option<Wire<Request>>,
  pub(crate) response_wire: Option<Wire<Response>>,
}

impl Flow {
  /// A flow for a freshly parsed request.
  pub fn new(id: FlowId, request: Request, client: ClientConn, origin: Option<Destination>) -> Self {
    Self {
      id,
      request,
      response: None,
      client,
      origin,
      error: None,
      hook_failures: Vec::new(),
      timestamps: Timestamps {
        request_received: SystemTime::now(),
        request_forwarded: None,
        response_received: None,
        response_forwarded: None,
      },
      request_wire: None,
      response_wire: None,
    }
  }

  pub(crate) fn with_request_raw(mut self, raw: Bytes) -> Self {
    self.request_wire = Some(Wire {
      original: self.request.clone(),
      raw,
    });
    self
  }

  pub(crate) fn set_response_from_wire(&mut self, response: Response, raw: Bytes) {
    self.response_wire = Some(Wire {
      original: response.clone(),
      raw,
    });
    self.response = Some(response);
    self.timestamps.response_received = Some(SystemTime::now());
  }

  /// Flow identifier.
  pub fn id(&self) -> FlowId {
    self.id
  }
  /// The client side of the exchange.
  pub fn client(&self) -> &ClientConn {
    &self.client
  }
  /// Where the request is (or would be) sent.
  pub fn origin(&self) -> Option<&Destination> {
    self.origin.as_ref()
  }
  pub(crate) fn set_origin(&mut self, origin: Destination) {
    self.origin = Some(origin);
  }
  /// Returns true if the client reached the proxy over TLS.
  pub fn is_tls(&self) -> bool {
    self.client.server_name.is_some() || self.request.scheme() == &http::uri::Scheme::HTTPS
  }
  /// The error that ended this flow, if any.
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }
  /// Mark the flow as failed.
  pub fn set_error(&mut self, error: impl ToString) {
    self.error = Some(error.to_string());
  }
  /// Hooks that failed while handling this flow, in dispatch order.
  pub fn hook_failures(&self) -> &[HookFailure] {
    &self.hook_failures
  }
  pub(crate) fn record_hook_failure(&mut self, failure: HookFailure) {
    self.hook_failures.push(failure);
  }
  /// Wall-clock milestones.
  pub fn timestamps(&self) -> &Timestamps {
    &self.timestamps
  }
  pub(crate) fn timestamps_mut(&mut self) -> &mut Timestamps {
    &mut self.timestamps
  }
}
