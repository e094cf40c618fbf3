use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::uri::Scheme;
use http::{Method, Version};

use crate::body::{decode_text, frame_body, Body};
use crate::cookies;
use crate::errors::{Error, Result};
use crate::headers::Headers;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An intercepted HTTP request.
///
/// The request target is split into scheme, authority and origin-form path so
/// that the full URL can be rebuilt even though the client only sent a path.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
  method: Method,
  scheme: Scheme,
  authority: String,
  path: String,
  version: Version,
  headers: Headers,
  body: Body,
}

impl Default for Request {
  fn default() -> Self {
    Self {
      method: Method::GET,
      scheme: Scheme::HTTP,
      authority: String::new(),
      path: "/".to_string(),
      version: Version::HTTP_11,
      headers: Headers::new(),
      body: Body::empty(),
    }
  }
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("url", &self.url())
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl Request {
  /// Create a request for an absolute URL.
  ///
  /// ```
  /// # use flowtap::Request;
  /// let request = Request::new(http::Method::GET, "https://example.com/x?y=1").unwrap();
  /// assert_eq!(request.host(), "example.com");
  /// assert_eq!(request.path(), "/x?y=1");
  /// ```
  pub fn new(method: Method, url: &str) -> Result<Request> {
    let uri: http::Uri = url.parse().map_err(http::Error::from)?;
    let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
    let authority = uri
      .authority()
      .map(|a| a.as_str().to_string())
      .ok_or_else(|| Error::malformed_recoverable(format!("url without host: {}", url)))?;
    let path = uri
      .path_and_query()
      .map(|p| p.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    let mut headers = Headers::new();
    headers.append("Host", authority.clone());
    Ok(Request {
      method,
      scheme,
      authority,
      path,
      headers,
      ..Request::default()
    })
  }

  /// Builder-style header append.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.append(name, value);
    self
  }

  /// Builder-style body replacement.
  pub fn with_body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self
  }

  pub(crate) fn from_parts(
    method: Method,
    target: &str,
    version: Version,
    headers: Headers,
  ) -> std::result::Result<Request, String> {
    let (scheme, authority, path) = split_target(&method, target, &headers)?;
    Ok(Request {
      method,
      scheme,
      authority,
      path,
      version,
      headers,
      body: Body::empty(),
    })
  }

  /// Serialize the request for the origin.
  ///
  /// Headers are written in their stored order and casing; the request target
  /// is always written in origin form. The body is framed to match the
  /// headers: re-chunked under `Transfer-Encoding: chunked`, otherwise with an
  /// exact `Content-Length`.
  pub fn to_raw(&self) -> Bytes {
    let mut headers = self.headers.clone();
    let body = frame_body(&mut headers, &self.body);
    let mut http_request = Vec::new();
    http_request.extend(self.method.as_str().as_bytes());
    http_request.extend(SPACE);
    if self.method == Method::CONNECT {
      http_request.extend(self.authority.as_bytes());
    } else {
      http_request.extend(self.path.as_bytes());
    }
    http_request.extend(SPACE);
    http_request.extend(format!("{:?}", self.version).as_bytes());
    http_request.extend(CR_LF);
    for (k, v) in headers.iter() {
      http_request.extend(k.as_bytes());
      http_request.extend(COLON_SPACE);
      http_request.extend(v.as_bytes());
      http_request.extend(CR_LF);
    }
    http_request.extend(CR_LF);
    http_request.extend(body);
    Bytes::from(http_request)
  }
}

impl Request {
  /// The HTTP method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// `http` or `https`, depending on how the client reached the proxy.
  #[inline]
  pub fn scheme(&self) -> &Scheme {
    &self.scheme
  }
  pub(crate) fn set_scheme(&mut self, scheme: Scheme) {
    self.scheme = scheme;
  }
  /// The `host[:port]` the request is addressed to.
  #[inline]
  pub fn authority(&self) -> &str {
    &self.authority
  }
  pub(crate) fn set_authority_if_empty(&mut self, authority: impl FnOnce() -> String) {
    if self.authority.is_empty() {
      self.authority = authority();
    }
  }
  /// The host part of the authority, without port or IPv6 brackets.
  pub fn host(&self) -> &str {
    split_host_port(&self.authority).0
  }
  /// The explicit port of the authority, else the scheme default.
  pub fn port(&self) -> u16 {
    split_host_port(&self.authority)
      .1
      .unwrap_or(if self.scheme == Scheme::HTTPS { 443 } else { 80 })
  }
  /// Origin-form request target (`/path?query`).
  #[inline]
  pub fn path(&self) -> &str {
    &self.path
  }
  /// Replace the request target.
  pub fn set_path(&mut self, path: impl Into<String>) {
    self.path = path.into();
  }
  /// The full URL: scheme, authority and path.
  pub fn url(&self) -> String {
    if self.method == Method::CONNECT {
      return self.authority.clone();
    }
    format!("{}://{}{}", self.scheme, self.authority, self.path)
  }
  /// The HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// The headers in wire order.
  #[inline]
  pub fn headers(&self) -> &Headers {
    &self.headers
  }
  /// Mutable access to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }
  /// The body, decoded from its transfer framing.
  #[inline]
  pub fn body(&self) -> &Body {
    &self.body
  }
  /// Mutable access to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }
  /// Replace the body.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    self.body = body.into();
  }
  /// The body as text, after undoing content-encoding and charset.
  pub fn text(&self) -> String {
    decode_text(&self.headers, &self.body)
  }
  /// Cookies sent by the client as `(name, first value)` pairs.
  pub fn cookies(&self) -> Vec<(String, String)> {
    cookies::first_values(cookies::extract_request_cookies(&self.headers))
  }
  /// Returns true if the client asked for the connection to be closed after this exchange.
  pub fn wants_close(&self) -> bool {
    if self.headers.has_token("connection", "close") {
      return true;
    }
    self.version <= Version::HTTP_10 && !self.headers.has_token("connection", "keep-alive")
  }
}

fn split_target(
  method: &Method,
  target: &str,
  headers: &Headers,
) -> std::result::Result<(Scheme, String, String), String> {
  let host_header = || headers.get("host").map(|h| h.trim().to_string()).unwrap_or_default();
  if method == Method::CONNECT {
    return Ok((Scheme::HTTP, target.to_string(), String::new()));
  }
  if target.starts_with('/') || target == "*" {
    return Ok((Scheme::HTTP, host_header(), target.to_string()));
  }
  // absolute-form, as sent by clients that believe they talk to a proxy
  let uri: http::Uri = target
    .parse()
    .map_err(|_| format!("invalid request target: {}", target))?;
  let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
  let authority = uri
    .authority()
    .map(|a| a.as_str().to_string())
    .unwrap_or_else(host_header);
  let path = uri
    .path_and_query()
    .map(|p| p.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  Ok((scheme, authority, path))
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub(crate) fn split_host_port(authority: &str) -> (&str, Option<u16>) {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      let host = &rest[..end];
      let port = rest[end + 1..]
        .strip_prefix(':')
        .and_then(|p| p.parse().ok());
      return (host, port);
    }
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(port) => (host, Some(port)),
      Err(_) => (authority, None),
    },
    _ => (authority, None),
  }
}
