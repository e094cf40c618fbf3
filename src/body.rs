use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;

use crate::headers::Headers;
use crate::CR_LF;

/// A message body, always held fully decoded from its transfer framing.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&String::from_utf8_lossy(&self.inner))
  }
}

/// Undo `Content-Encoding` and decode the body to text using the `charset`
/// parameter of `Content-Type`, falling back to lossy UTF-8.
pub(crate) fn decode_text(headers: &Headers, body: &Body) -> String {
  if body.is_empty() {
    return String::new();
  }
  let content = decode_content(headers, body);
  #[cfg(feature = "charset")]
  {
    use encoding_rs::{Encoding, UTF_8};
    let charset = headers
      .get("content-type")
      .and_then(|value| value.parse::<mime::Mime>().ok())
      .and_then(|mime| mime.get_param("charset").map(|c| c.as_str().to_string()));
    if let Some(label) = charset {
      let encoding = Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8);
      let (text, _, _) = encoding.decode(&content);
      return text.into_owned();
    }
  }
  String::from_utf8_lossy(&content).into_owned()
}

/// Fit the framing headers to `body` and return the body bytes as they go on
/// the wire.
///
/// A chunked message keeps its coding and the body is sent as one chunk. Any
/// other message gets an exact `Content-Length` when it declared one or has a
/// body. A transfer coding other than chunked leaves the body close-delimited.
pub(crate) fn frame_body(headers: &mut Headers, body: &[u8]) -> Vec<u8> {
  if headers.contains("transfer-encoding") {
    if !headers.is_chunked() {
      return body.to_vec();
    }
    headers.remove("content-length");
    let mut wire = Vec::with_capacity(body.len() + 16);
    if !body.is_empty() {
      wire.extend(format!("{:x}", body.len()).as_bytes());
      wire.extend(CR_LF);
      wire.extend(body);
      wire.extend(CR_LF);
    }
    wire.extend(b"0\r\n\r\n");
    return wire;
  }
  if headers.contains("content-length") || !body.is_empty() {
    headers.set("Content-Length", body.len().to_string());
  }
  body.to_vec()
}

#[cfg(feature = "gzip")]
fn decode_content(headers: &Headers, body: &Body) -> Bytes {
  use flate2::read::{MultiGzDecoder, ZlibDecoder};
  use std::io::Read;

  let encoding = match headers.get("content-encoding") {
    Some(ce) => ce.trim().to_ascii_lowercase(),
    None => return body.inner.clone(),
  };
  let mut decoded = Vec::new();
  let result = match encoding.as_str() {
    "gzip" | "x-gzip" => MultiGzDecoder::new(&body[..]).read_to_end(&mut decoded),
    "deflate" => ZlibDecoder::new(&body[..]).read_to_end(&mut decoded),
    _ => return body.inner.clone(),
  };
  match result {
    Ok(_) => Bytes::from(decoded),
    Err(err) => {
      tracing::debug!("cannot undo content-encoding {}: {}", encoding, err);
      body.inner.clone()
    }
  }
}

#[cfg(not(feature = "gzip"))]
fn decode_content(_headers: &Headers, body: &Body) -> Bytes {
  body.inner.clone()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunked_bodies_are_rechunked() {
    let mut headers: Headers = vec![("Transfer-Encoding", "chunked"), ("Content-Length", "3")]
      .into_iter()
      .collect();
    assert_eq!(frame_body(&mut headers, b"hello"), b"5\r\nhello\r\n0\r\n\r\n".to_vec());
    assert!(!headers.contains("content-length"));
    assert_eq!(frame_body(&mut headers, b""), b"0\r\n\r\n".to_vec());
  }

  #[test]
  fn declared_length_follows_the_body() {
    let mut headers: Headers = vec![("Content-Length", "3")].into_iter().collect();
    assert_eq!(frame_body(&mut headers, b"hello"), b"hello".to_vec());
    assert_eq!(headers.get("content-length"), Some("5"));
    let mut bare = Headers::new();
    frame_body(&mut bare, b"");
    assert!(bare.is_empty());
  }

  #[test]
  fn plain_utf8_text() {
    let headers = Headers::new();
    assert_eq!(decode_text(&headers, &Body::from("{\"ok\":true}")), "{\"ok\":true}");
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn gzip_text_is_decoded() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"hello gzip").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut headers = Headers::new();
    headers.append("Content-Encoding", "gzip");
    assert_eq!(decode_text(&headers, &Body::from(compressed)), "hello gzip");
  }

  #[cfg(feature = "charset")]
  #[test]
  fn charset_parameter_is_honoured() {
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain; charset=iso-8859-1");
    let body = Body::from(vec![0x63, 0x61, 0x66, 0xe9]);
    assert_eq!(decode_text(&headers, &body), "café");
  }
}
