use crate::headers::Headers;

/// A cookie parsed from a `Set-Cookie` or `Cookie` header.
#[derive(Debug, Clone)]
pub(crate) struct Cookie<'a>(cookie::Cookie<'a>);

impl<'a> Cookie<'a> {
  fn parse(value: &'a str) -> Result<Cookie<'a>, cookie::ParseError> {
    cookie::Cookie::parse(value).map(Cookie)
  }

  /// cookie name
  pub(crate) fn name(&self) -> &str {
    self.0.name()
  }

  /// cookie value, without surrounding quotes
  pub(crate) fn value(&self) -> &str {
    self.0.value_trimmed()
  }
}

/// Every parseable `Set-Cookie` header, in wire order. Invalid headers are skipped.
pub(crate) fn extract_response_cookies(headers: &Headers) -> impl Iterator<Item = Cookie<'_>> {
  headers
    .get_all("set-cookie")
    .filter_map(|value| Cookie::parse(value).ok())
}

/// Every pair of the request's `Cookie` headers, in wire order.
pub(crate) fn extract_request_cookies(headers: &Headers) -> impl Iterator<Item = Cookie<'_>> {
  headers
    .get_all("cookie")
    .flat_map(cookie::Cookie::split_parse)
    .filter_map(|c| c.ok().map(Cookie))
}

/// Collapse cookies into `(name, first value)` pairs, keeping first-seen order.
pub(crate) fn first_values<'a>(cookies: impl Iterator<Item = Cookie<'a>>) -> Vec<(String, String)> {
  let mut out: Vec<(String, String)> = Vec::new();
  for cookie in cookies {
    if out.iter().any(|(name, _)| name == cookie.name()) {
      continue;
    }
    out.push((cookie.name().to_string(), cookie.value().to_string()));
  }
  out
}
