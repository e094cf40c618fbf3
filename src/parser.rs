//! HTTP/1.x message reader
//!
//! A [`MessageReader`] owns the buffered read half of one leg of a connection
//! and pulls exactly one message per call, so several exchanges can be read
//! off the same keep-alive stream. Every byte consumed for a message is kept
//! alongside the parsed form, which lets unmodified messages be relayed
//! verbatim.

use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::errors::{Error, Result};
use crate::headers::Headers;
use crate::response::is_bodyless;
use crate::{Request, Response};

/// Upper bound for a message head (start line plus header fields).
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a chunk-size line or the CRLF after chunk data.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// How the body of a message was delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// no body
  Empty,
  /// `Content-Length` delimited
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// response body delimited by the origin closing the connection
  UntilClose,
}

/// A parsed message together with the exact bytes it was read from.
#[derive(Debug, Clone)]
pub struct Parsed<T> {
  /// the parsed message, body decoded from its framing
  pub message: T,
  /// the bytes consumed from the stream for this message
  pub raw: Bytes,
  /// how the body was delimited
  pub framing: Framing,
}

struct Head {
  start_line: Vec<u8>,
  lines: Vec<Vec<u8>>,
  raw: Vec<u8>,
}

/// Reads framed HTTP/1.x messages off a stream.
#[derive(Debug)]
pub struct MessageReader<T> {
  reader: BufReader<T>,
}

impl<T: AsyncRead + Unpin> MessageReader<T> {
  /// Wrap a stream.
  pub fn new(inner: T) -> Self {
    Self {
      reader: BufReader::new(inner),
    }
  }

  /// The underlying stream.
  pub fn get_ref(&self) -> &T {
    self.reader.get_ref()
  }

  /// The underlying stream, for writing. Reading through it would skip buffered bytes.
  pub fn get_mut(&mut self) -> &mut T {
    self.reader.get_mut()
  }

  /// Consume the reader, returning the stream and any bytes read ahead but not yet parsed.
  pub fn into_parts(self) -> (T, Bytes) {
    let buffered = Bytes::copy_from_slice(self.reader.buffer());
    (self.reader.into_inner(), buffered)
  }

  /// Read one request.
  ///
  /// Returns `Ok(None)` if the peer closed the stream cleanly before sending
  /// another message.
  pub async fn parse_request(&mut self) -> Result<Option<Parsed<Request>>> {
    let Head {
      start_line,
      lines,
      mut raw,
    } = match self.read_head().await? {
      Some(head) => head,
      None => return Ok(None),
    };
    let reject = rejecter(&lines);
    let (method, target, version) = parse_request_line(&start_line).map_err(&reject)?;
    let headers = parse_headers(&lines).map_err(&reject)?;
    let mut request = Request::from_parts(method, &target, version, headers).map_err(&reject)?;
    let framing = request_framing(request.headers())?;
    let body = self.read_body(framing, &mut raw).await?;
    request.set_body(body);
    Ok(Some(Parsed {
      message: request,
      raw: Bytes::from(raw),
      framing,
    }))
  }

  /// Read the response to a request made with `method`.
  ///
  /// Interim `1xx` responses other than `101 Switching Protocols` are consumed
  /// and dropped.
  pub async fn parse_response(&mut self, method: &Method) -> Result<Parsed<Response>> {
    loop {
      let Head {
        start_line,
        lines,
        mut raw,
      } = match self.read_head().await? {
        Some(head) => head,
        None => {
          return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before response head",
          )))
        }
      };
      let reject = rejecter(&lines);
      let (version, status, reason) = parse_status_line(&start_line).map_err(&reject)?;
      let headers = parse_headers(&lines).map_err(&reject)?;
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::trace!("skipping interim response {}", status);
        continue;
      }
      let mut response = Response::from_parts(version, status, reason, headers);
      let framing = response_framing(method, status, response.headers())?;
      let body = self.read_body(framing, &mut raw).await?;
      response.set_body(body);
      return Ok(Parsed {
        message: response,
        raw: Bytes::from(raw),
        framing,
      });
    }
  }

  /// Read one line of at most `limit` bytes, newline included, into `line`.
  ///
  /// Returns 0 at end of stream. Nothing past `limit` is buffered: a line
  /// still without its newline at that point fails with `too_long`.
  async fn read_line(&mut self, line: &mut Vec<u8>, limit: usize, too_long: &str) -> Result<usize> {
    if limit == 0 {
      return Err(Error::malformed(too_long));
    }
    let n = (&mut self.reader)
      .take(limit as u64)
      .read_until(b'\n', line)
      .await?;
    if n == limit && !line.ends_with(b"\n") {
      return Err(Error::malformed(too_long));
    }
    Ok(n)
  }

  async fn read_head(&mut self) -> Result<Option<Head>> {
    let mut line = Vec::new();
    // stray CRLFs between messages are tolerated
    loop {
      line.clear();
      let n = self
        .read_line(&mut line, MAX_HEAD_SIZE, "start line too long")
        .await?;
      if n == 0 {
        return Ok(None);
      }
      if !trim_crlf(&line).is_empty() {
        break;
      }
    }
    let mut raw = line.clone();
    let start_line = trim_crlf(&line).to_vec();
    let mut lines = Vec::new();
    loop {
      line.clear();
      let limit = MAX_HEAD_SIZE.saturating_sub(raw.len());
      let too_long = format!("message head exceeds {} bytes", MAX_HEAD_SIZE);
      let n = self.read_line(&mut line, limit, &too_long).await?;
      if n == 0 {
        return Err(Error::malformed("connection closed inside message head"));
      }
      raw.extend_from_slice(&line);
      let field = trim_crlf(&line);
      if field.is_empty() {
        break;
      }
      lines.push(field.to_vec());
    }
    Ok(Some(Head {
      start_line,
      lines,
      raw,
    }))
  }

  async fn read_body(&mut self, framing: Framing, raw: &mut Vec<u8>) -> Result<Vec<u8>> {
    match framing {
      Framing::Empty => Ok(Vec::new()),
      Framing::Length(length) => {
        let mut body = Vec::new();
        let n = (&mut self.reader).take(length).read_to_end(&mut body).await?;
        if (n as u64) < length {
          return Err(Error::malformed(format!(
            "connection closed after {} of {} body bytes",
            n, length
          )));
        }
        raw.extend_from_slice(&body);
        Ok(body)
      }
      Framing::Chunked => self.read_chunked_body(raw).await,
      Framing::UntilClose => {
        let mut body = Vec::new();
        self.reader.read_to_end(&mut body).await?;
        raw.extend_from_slice(&body);
        Ok(body)
      }
    }
  }

  async fn read_chunked_body(&mut self, raw: &mut Vec<u8>) -> Result<Vec<u8>> {
    let mut body: Vec<u8> = Vec::new();
    let mut line = Vec::new();
    loop {
      line.clear();
      let n = self
        .read_line(&mut line, MAX_CHUNK_LINE, "chunk size line too long")
        .await?;
      if n == 0 {
        return Err(Error::malformed("connection closed inside chunked body"));
      }
      raw.extend_from_slice(&line);
      let size = parse_chunk_size(trim_crlf(&line))?;
      if size == 0 {
        break;
      }
      let start = body.len();
      let n = (&mut self.reader).take(size).read_to_end(&mut body).await?;
      if (n as u64) < size {
        return Err(Error::malformed("connection closed inside chunk"));
      }
      raw.extend_from_slice(&body[start..]);
      line.clear();
      let n = self
        .read_line(&mut line, MAX_CHUNK_LINE, "missing CRLF after chunk data")
        .await?;
      if n == 0 {
        return Err(Error::malformed("connection closed inside chunked body"));
      }
      raw.extend_from_slice(&line);
      if !trim_crlf(&line).is_empty() {
        return Err(Error::malformed("missing CRLF after chunk data"));
      }
    }
    // trailer fields are relayed in `raw` but not merged into the headers
    let mut trailer_len = 0;
    loop {
      line.clear();
      let n = self
        .read_line(
          &mut line,
          MAX_HEAD_SIZE.saturating_sub(trailer_len),
          "chunked trailer too long",
        )
        .await?;
      if n == 0 {
        return Err(Error::malformed("connection closed inside chunked trailer"));
      }
      trailer_len += n;
      raw.extend_from_slice(&line);
      if trim_crlf(&line).is_empty() {
        break;
      }
    }
    Ok(body)
  }
}

/// Syntax errors in a head are recoverable when nothing in the head announces a body.
fn rejecter(lines: &[Vec<u8>]) -> impl Fn(String) -> Error {
  let declares_body = lines.iter().any(|line| {
    let name = line.split(|b| *b == b':').next().unwrap_or_default();
    name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"transfer-encoding")
  });
  move |reason| {
    if declares_body {
      Error::malformed(reason)
    } else {
      Error::malformed_recoverable(reason)
    }
  }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(v: &[u8]) -> Option<Version> {
  match v {
    b"HTTP/1.0" => Some(Version::HTTP_10),
    b"HTTP/1.1" => Some(Version::HTTP_11),
    _ => None,
  }
}

fn parse_request_line(line: &[u8]) -> std::result::Result<(Method, String, Version), String> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
    _ => {
      return Err(format!(
        "invalid request line: {}",
        line.escape_ascii()
      ))
    }
  };
  let method = Method::from_bytes(method).map_err(|e| e.to_string())?;
  let target = std::str::from_utf8(target)
    .map_err(|_| "request target is not valid UTF-8".to_string())?
    .to_string();
  let version = parse_version(version)
    .ok_or_else(|| format!("unsupported http version: {}", version.escape_ascii()))?;
  Ok((method, target, version))
}

fn parse_status_line(line: &[u8]) -> std::result::Result<(Version, StatusCode, String), String> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parts
    .next()
    .and_then(parse_version)
    .ok_or_else(|| format!("invalid status line: {}", line.escape_ascii()))?;
  let status = parts
    .next()
    .filter(|code| code.len() == 3)
    .and_then(|code| StatusCode::from_bytes(code).ok())
    .ok_or_else(|| format!("invalid status code in: {}", line.escape_ascii()))?;
  let reason = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
  Ok((version, status, reason))
}

fn is_tchar(b: &u8) -> bool {
  b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(b)
}

/// Parse header field lines, joining obsolete line folding into the previous value.
fn parse_headers(lines: &[Vec<u8>]) -> std::result::Result<Headers, String> {
  let mut fields: Vec<(String, String)> = Vec::with_capacity(lines.len());
  for line in lines {
    if line.starts_with(b" ") || line.starts_with(b"\t") {
      let (_, value) = fields
        .last_mut()
        .ok_or_else(|| "continuation line before the first header".to_string())?;
      let continuation = String::from_utf8_lossy(line);
      let continuation = continuation.trim();
      if !continuation.is_empty() {
        if !value.is_empty() {
          value.push(' ');
        }
        value.push_str(continuation);
      }
      continue;
    }
    let colon = line
      .iter()
      .position(|b| *b == b':')
      .ok_or_else(|| format!("header line without colon: {}", line.escape_ascii()))?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(is_tchar) {
      return Err(format!("invalid header name: {}", name.escape_ascii()));
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    fields.push((
      String::from_utf8_lossy(name).into_owned(),
      value.trim().to_string(),
    ));
  }
  Ok(fields.into_iter().collect())
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
    let parsed: u64 = value
      .trim()
      .parse()
      .map_err(|_| Error::malformed(format!("invalid content-length: {}", value)))?;
    match length {
      Some(previous) if previous != parsed => {
        return Err(Error::malformed("conflicting content-length values"));
      }
      _ => length = Some(parsed),
    }
  }
  Ok(length)
}

fn request_framing(headers: &Headers) -> Result<Framing> {
  if headers.contains("transfer-encoding") {
    return if headers.is_chunked() {
      Ok(Framing::Chunked)
    } else {
      Err(Error::malformed("request transfer-encoding does not end in chunked"))
    };
  }
  Ok(match content_length(headers)? {
    Some(0) | None => Framing::Empty,
    Some(length) => Framing::Length(length),
  })
}

fn response_framing(method: &Method, status: StatusCode, headers: &Headers) -> Result<Framing> {
  if is_bodyless(method, status) {
    return Ok(Framing::Empty);
  }
  if headers.contains("transfer-encoding") {
    return Ok(if headers.is_chunked() {
      Framing::Chunked
    } else {
      Framing::UntilClose
    });
  }
  Ok(match content_length(headers)? {
    Some(0) => Framing::Empty,
    Some(length) => Framing::Length(length),
    None => Framing::UntilClose,
  })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size)
    .map_err(|_| Error::malformed("chunk size is not ASCII"))?
    .trim();
  u64::from_str_radix(size, 16).map_err(|_| Error::malformed(format!("invalid chunk size: {:?}", size)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn reader(data: &'static [u8]) -> MessageReader<Cursor<&'static [u8]>> {
    MessageReader::new(Cursor::new(data))
  }

  #[tokio::test]
  async fn reads_pipelined_requests() {
    let mut reader = reader(
      b"POST /a HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\nHost: h\r\n\r\n",
    );
    let first = reader.parse_request().await.unwrap().unwrap();
    assert_eq!(first.message.path(), "/a");
    assert_eq!(&first.message.body()[..], b"abc");
    assert_eq!(first.framing, Framing::Length(3));
    let second = reader.parse_request().await.unwrap().unwrap();
    assert_eq!(second.message.path(), "/b");
    assert!(second.message.body().is_empty());
    assert!(reader.parse_request().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn chunked_and_length_bodies_agree() {
    let mut chunked = reader(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: t\r\n\r\n",
    );
    let mut length = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nWikipedia");
    let chunked = chunked.parse_response(&Method::GET).await.unwrap();
    let length = length.parse_response(&Method::GET).await.unwrap();
    assert_eq!(chunked.message.body(), length.message.body());
    assert_eq!(&chunked.message.body()[..], b"Wikipedia");
    assert!(chunked.raw.ends_with(b"X-Trailer: t\r\n\r\n"));
  }

  #[tokio::test]
  async fn eof_inside_chunk_is_unrecoverable() {
    let mut reader = reader(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n10\r\nshort");
    let err = reader.parse_response(&Method::GET).await.unwrap_err();
    assert!(err.is_fatal_to_connection());
  }

  #[tokio::test]
  async fn folded_headers_are_joined() {
    let mut reader = reader(b"GET / HTTP/1.1\r\nHost: h\r\nX-Long: one\r\n  two\r\n\r\n");
    let request = reader.parse_request().await.unwrap().unwrap().message;
    assert_eq!(request.headers().get("x-long"), Some("one two"));
  }

  #[tokio::test]
  async fn bad_header_without_body_is_recoverable() {
    let mut reader = reader(b"GET / HTTP/1.1\r\nBroken header\r\n\r\nGET /next HTTP/1.1\r\nHost: h\r\n\r\n");
    let err = reader.parse_request().await.unwrap_err();
    assert!(matches!(err, Error::MalformedMessage { recoverable: true, .. }));
    let next = reader.parse_request().await.unwrap().unwrap();
    assert_eq!(next.message.path(), "/next");
  }

  #[tokio::test]
  async fn bad_header_with_body_is_fatal() {
    let mut reader = reader(b"POST / HTTP/1.1\r\nBad Name: x\r\nContent-Length: 2\r\n\r\nhi");
    let err = reader.parse_request().await.unwrap_err();
    assert!(err.is_fatal_to_connection());
  }

  #[tokio::test]
  async fn head_and_not_modified_have_no_body() {
    let mut reader = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHTTP/1.1 304 Not Modified\r\n\r\n");
    let head = reader.parse_response(&Method::HEAD).await.unwrap();
    assert!(head.message.body().is_empty());
    let cached = reader.parse_response(&Method::GET).await.unwrap();
    assert_eq!(cached.message.status_code(), StatusCode::NOT_MODIFIED);
  }

  #[tokio::test]
  async fn close_delimited_response_reads_to_eof() {
    let mut reader = reader(b"HTTP/1.0 200 OK\r\n\r\nuntil the end");
    let response = reader.parse_response(&Method::GET).await.unwrap();
    assert_eq!(response.framing, Framing::UntilClose);
    assert_eq!(response.message.text(), "until the end");
  }

  #[tokio::test]
  async fn interim_responses_are_skipped() {
    let mut reader = reader(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
    let response = reader.parse_response(&Method::POST).await.unwrap();
    assert_eq!(response.message.status_code(), StatusCode::CREATED);
    assert!(response.raw.starts_with(b"HTTP/1.1 201"));
  }

  #[tokio::test]
  async fn unterminated_start_line_is_bounded() {
    let mut reader = MessageReader::new(Cursor::new(vec![b'A'; 1024 * 1024]));
    let err = reader.parse_request().await.unwrap_err();
    assert!(err.is_fatal_to_connection());
    // at most one buffer fill past the limit was pulled off the stream
    assert!(reader.get_ref().position() <= (MAX_HEAD_SIZE + 8 * 1024) as u64);
  }

  #[tokio::test]
  async fn oversized_header_block_is_rejected() {
    let mut wire = b"GET / HTTP/1.1\r\n".to_vec();
    for i in 0..MAX_HEAD_SIZE / 16 {
      wire.extend(format!("X-{:05}: aaaaaa\r\n", i).as_bytes());
    }
    wire.extend(b"\r\n");
    let mut reader = MessageReader::new(Cursor::new(wire));
    let err = reader.parse_request().await.unwrap_err();
    assert!(err.to_string().contains("message head exceeds"));
  }

  #[tokio::test]
  async fn unterminated_chunk_size_is_bounded() {
    let mut wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    wire.extend(vec![b'f'; 1024 * 1024]);
    let mut reader = MessageReader::new(Cursor::new(wire));
    let err = reader.parse_response(&Method::GET).await.unwrap_err();
    assert!(err.to_string().contains("chunk size line too long"));
    assert!(reader.get_ref().position() < 64 * 1024);
  }

  #[tokio::test]
  async fn serialized_messages_parse_back_equal() {
    let wires: [&'static [u8]; 3] = [
      b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhe\r\n3\r\nllo\r\n0\r\n\r\n",
      b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello",
      b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n",
    ];
    for wire in wires {
      let mut first = reader(wire).parse_request().await.unwrap().unwrap().message;
      let again = first.to_raw();
      let second = MessageReader::new(Cursor::new(again.to_vec()))
        .parse_request()
        .await
        .unwrap()
        .unwrap()
        .message;
      assert_eq!(first, second);

      first.set_body("edited body");
      let edited = MessageReader::new(Cursor::new(first.to_raw().to_vec()))
        .parse_request()
        .await
        .unwrap()
        .unwrap()
        .message;
      assert_eq!(&edited.body()[..], b"edited body");
    }

    let response = reader(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
      .parse_response(&Method::GET)
      .await
      .unwrap()
      .message;
    let again = MessageReader::new(Cursor::new(response.to_raw().to_vec()))
      .parse_response(&Method::GET)
      .await
      .unwrap()
      .message;
    assert_eq!(response, again);
  }

  #[tokio::test]
  async fn raw_bytes_are_exact() {
    let wire: &'static [u8] = b"GET /x HTTP/1.1\r\nhOsT: a\r\n\r\n";
    let mut reader = reader(wire);
    let parsed = reader.parse_request().await.unwrap().unwrap();
    assert_eq!(&parsed.raw[..], wire);
    assert_eq!(parsed.message.to_raw(), parsed.raw);
  }
}
