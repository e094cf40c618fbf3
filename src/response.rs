use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{Method, StatusCode, Version};

use crate::body::{decode_text, frame_body, Body};
use crate::cookies;
use crate::headers::Headers;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An intercepted HTTP response.
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: String,
  headers: Headers,
  body: Body,
}

impl Default for Response {
  fn default() -> Self {
    Response::new(StatusCode::OK)
  }
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status_code", &self.status_code)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl Response {
  /// A bare HTTP/1.1 response with the canonical reason phrase.
  pub fn new(status_code: StatusCode) -> Self {
    Self {
      version: Version::HTTP_11,
      status_code,
      reason: status_code.canonical_reason().unwrap_or_default().to_string(),
      headers: Headers::new(),
      body: Body::empty(),
    }
  }

  /// Builder-style header append.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.append(name, value);
    self
  }

  /// Builder-style body replacement; sets `Content-Length` to match.
  pub fn with_body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self.headers.set("Content-Length", self.body.len().to_string());
    self
  }

  pub(crate) fn from_parts(
    version: Version,
    status_code: StatusCode,
    reason: String,
    headers: Headers,
  ) -> Self {
    Self {
      version,
      status_code,
      reason,
      headers,
      body: Body::empty(),
    }
  }

  /// Serialize the response for the client.
  ///
  /// The body is framed to match the headers: re-chunked under
  /// `Transfer-Encoding: chunked`, otherwise with an exact `Content-Length`.
  /// Statuses that never carry a body are written as a head only.
  pub fn to_raw(&self) -> Bytes {
    if is_bodyless(&Method::GET, self.status_code) {
      return self.head_to_raw();
    }
    let mut headers = self.headers.clone();
    let body = frame_body(&mut headers, &self.body);
    let mut http_response = self.serialize_head(&headers);
    http_response.extend(body);
    Bytes::from(http_response)
  }

  /// The status line and headers exactly as stored, without a body.
  pub(crate) fn head_to_raw(&self) -> Bytes {
    Bytes::from(self.serialize_head(&self.headers))
  }

  fn serialize_head(&self, headers: &Headers) -> Vec<u8> {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.reason.as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in headers.iter() {
      http_response.extend(k.as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response
  }
}

impl Response {
  /// The status code.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Replace the status code and its reason phrase.
  pub fn set_status_code(&mut self, status_code: StatusCode) {
    self.status_code = status_code;
    self.reason = status_code.canonical_reason().unwrap_or_default().to_string();
  }
  /// The reason phrase exactly as the origin sent it.
  #[inline]
  pub fn reason(&self) -> &str {
    &self.reason
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
  /// Cookies set by this response as `(name, first value)` pairs.
  ///
  /// Invalid `Set-Cookie` headers are ignored.
  pub fn cookies(&self) -> Vec<(String, String)> {
    cookies::first_values(cookies::extract_response_cookies(&self.headers))
  }
  /// Returns true if the origin will close the connection after this response.
  pub fn wants_close(&self) -> bool {
    if self.headers.has_token("connection", "close") {
      return true;
    }
    self.version <= Version::HTTP_10 && !self.headers.has_token("connection", "keep-alive")
  }
}

/// Returns true if a response to `method` with `status` never carries a body.
pub(crate) fn is_bodyless(method: &Method, status: StatusCode) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || (method == Method::CONNECT && status.is_success())
}
