//! Writing (possibly edited) messages to the peer.

use crate::errors::{Error, Result};
use crate::flow::Flow;
use crate::headers::Headers;
use crate::response::is_bodyless;
use bytes::Bytes;
use http::Method;
use std::io;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Serializes flow messages and writes them to a session.
///
/// A message equal to what was read off the wire is written as the exact
/// bytes received. An edited message is re-serialized with its header order
/// and casing kept and its framing recomputed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Forwarder {
  write_timeout: Option<Duration>,
}

impl Forwarder {
  /// A forwarder whose writes give up after `write_timeout`.
  pub fn new(write_timeout: Option<Duration>) -> Self {
    Self { write_timeout }
  }

  /// Write the flow's request to the origin session.
  pub async fn forward_request<W>(&self, flow: &mut Flow, origin: &mut W) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let bytes = request_bytes(flow);
    self.write(origin, &bytes).await?;
    flow.timestamps_mut().request_forwarded = Some(SystemTime::now());
    Ok(())
  }

  /// Write the flow's response to the client session.
  ///
  /// A flow without a response is an error; nothing is written.
  pub async fn forward_response<W>(&self, flow: &mut Flow, client: &mut W) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let bytes = response_bytes(flow).ok_or_else(|| {
      Error::Forward(io::Error::new(
        io::ErrorKind::InvalidInput,
        "flow has no response",
      ))
    })?;
    self.write(client, &bytes).await?;
    flow.timestamps_mut().response_forwarded = Some(SystemTime::now());
    Ok(())
  }

  async fn write<W>(&self, writer: &mut W, bytes: &[u8]) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let fut = async {
      writer.write_all(bytes).await?;
      writer.flush().await
    };
    match self.write_timeout {
      None => fut.await.map_err(Error::Forward),
      Some(t) => tokio::time::timeout(t, fut)
        .await
        .map_err(|_| Error::Forward(io::Error::from(io::ErrorKind::TimedOut)))?
        .map_err(Error::Forward),
    }
  }
}

/// The bytes to send upstream for the flow's request.
pub fn request_bytes(flow: &Flow) -> Bytes {
  match &flow.request_wire {
    Some(wire) if wire.original == flow.request => wire.raw.clone(),
    _ => {
      let mut request = flow.request.clone();
      let had_length = request.headers().contains("content-length");
      let body_len = request.body().len();
      normalize_framing(request.headers_mut(), body_len, had_length);
      request.to_raw()
    }
  }
}

/// The bytes to send to the client for the flow's response, if there is one.
pub fn response_bytes(flow: &Flow) -> Option<Bytes> {
  let response = flow.response.as_ref()?;
  if let Some(wire) = &flow.response_wire {
    if &wire.original == response {
      return Some(wire.raw.clone());
    }
  }
  let mut response = response.clone();
  if is_bodyless(flow.request.method(), response.status_code()) {
    // a HEAD response describes the body a GET would get; its framing headers stay
    if flow.request.method() != Method::HEAD {
      response.headers_mut().remove("transfer-encoding");
    }
    return Some(response.head_to_raw());
  }
  let body_len = response.body().len();
  normalize_framing(response.headers_mut(), body_len, true);
  Some(response.to_raw())
}

/// Replace transfer framing by an exact `Content-Length`.
fn normalize_framing(headers: &mut Headers, body_len: usize, always_length: bool) {
  headers.remove("transfer-encoding");
  if always_length || body_len > 0 {
    headers.set("Content-Length", body_len.to_string());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::{ClientConn, FlowId};
  use crate::parser::MessageReader;
  use crate::{Request, Response};
  use http::StatusCode;
  use std::io::Cursor;

  async fn parsed_flow(request: &'static [u8], response: &'static [u8]) -> Flow {
    let mut reader = MessageReader::new(Cursor::new(request));
    let parsed = reader.parse_request().await.unwrap().unwrap();
    let method = parsed.message.method().clone();
    let client = ClientConn {
      peer_addr: "127.0.0.1:1".parse().unwrap(),
      server_name: None,
    };
    let mut flow = Flow::new(FlowId { connection: 1, sequence: 1 }, parsed.message, client, None)
      .with_request_raw(parsed.raw);
    let mut reader = MessageReader::new(Cursor::new(response));
    let parsed = reader.parse_response(&method).await.unwrap();
    flow.set_response_from_wire(parsed.message, parsed.raw);
    flow
  }

  #[tokio::test]
  async fn untouched_messages_pass_through_verbatim() {
    let request = b"POST /x HTTP/1.1\r\nHOST:  a \r\ntransfer-encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nset-cookie: a=1\r\nContent-Length: 2\r\n\r\nok";
    let flow = parsed_flow(request, response).await;
    assert_eq!(&request_bytes(&flow)[..], &request[..]);
    assert_eq!(&response_bytes(&flow).unwrap()[..], &response[..]);
  }

  #[tokio::test]
  async fn edited_request_is_reframed() {
    let request = b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
    let response = b"HTTP/1.1 204 No Content\r\n\r\n";
    let mut flow = parsed_flow(request, response).await;
    flow.request.set_body("hello");
    assert_eq!(
      &request_bytes(&flow)[..],
      &b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello"[..]
    );
  }

  #[tokio::test]
  async fn edited_response_keeps_header_order() {
    let request = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-B: 1\r\n\r\nok";
    let mut flow = parsed_flow(request, response).await;
    if let Some(r) = flow.response.as_mut() {
      r.set_body("changed");
    }
    assert_eq!(
      &response_bytes(&flow).unwrap()[..],
      &b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nX-B: 1\r\n\r\nchanged"[..]
    );
  }

  #[tokio::test]
  async fn hook_made_response_gets_length() {
    let request = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let mut reader = MessageReader::new(Cursor::new(&request[..]));
    let parsed = reader.parse_request().await.unwrap().unwrap();
    let client = ClientConn {
      peer_addr: "127.0.0.1:1".parse().unwrap(),
      server_name: None,
    };
    let mut flow = Flow::new(FlowId { connection: 1, sequence: 1 }, parsed.message, client, None);
    flow.response = Some(Response::new(StatusCode::FORBIDDEN));
    let bytes = response_bytes(&flow).unwrap();
    assert_eq!(&bytes[..], &b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n"[..]);

    let mut sink = Vec::new();
    Forwarder::default()
      .forward_response(&mut flow, &mut sink)
      .await
      .unwrap();
    assert_eq!(sink, bytes.to_vec());
    assert!(flow.timestamps().response_forwarded.is_some());
  }

  #[tokio::test]
  async fn stalled_peer_hits_write_timeout() {
    let request = Request::new(Method::POST, "http://a/").unwrap().with_body(vec![b'x'; 64 * 1024]);
    let client = ClientConn {
      peer_addr: "127.0.0.1:1".parse().unwrap(),
      server_name: None,
    };
    let mut flow = Flow::new(FlowId { connection: 1, sequence: 1 }, request, client, None);
    // nobody reads the other half, so the pipe fills up
    let (mut origin, _stalled) = tokio::io::duplex(1024);
    let err = Forwarder::new(Some(Duration::from_millis(50)))
      .forward_request(&mut flow, &mut origin)
      .await
      .err()
      .unwrap();
    match err {
      Error::Forward(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
      other => panic!("unexpected error: {}", other),
    }
    assert!(flow.timestamps().request_forwarded.is_none());
  }

  #[tokio::test]
  async fn missing_response_is_a_forward_error() {
    let request = Request::new(Method::GET, "http://a/").unwrap();
    let client = ClientConn {
      peer_addr: "127.0.0.1:1".parse().unwrap(),
      server_name: None,
    };
    let mut flow = Flow::new(FlowId { connection: 1, sequence: 1 }, request, client, None);
    let mut sink = Vec::new();
    let err = Forwarder::default()
      .forward_response(&mut flow, &mut sink)
      .await
      .err()
      .unwrap();
    assert!(matches!(err, Error::Forward(_)));
    assert!(sink.is_empty());
  }
}
