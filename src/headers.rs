//! Ordered header collection
//!
//! Headers are kept as they appeared on the wire: in order, with their original
//! casing and with duplicates (`Set-Cookie`) preserved. Lookups are ASCII
//! case-insensitive.

use std::fmt;

/// An ordered, multi-valued list of `(name, value)` header pairs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
  fields: Vec<(String, String)>,
}

impl Headers {
  /// Create an empty header list.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of header fields, counting duplicates.
  pub fn len(&self) -> usize {
    self.fields.len()
  }

  /// Returns true if there are no header fields.
  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  /// The first value for `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .fields
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Every value for `name`, in wire order.
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .fields
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Returns true if a field named `name` exists.
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Append a field at the end, keeping any existing ones.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.fields.push((name.into(), value.into()));
  }

  /// Replace the value of the first field named `name` and drop the others.
  ///
  /// The first field keeps its position and casing; if none exists the field is appended.
  pub fn set(&mut self, name: &str, value: impl Into<String>) {
    let value = value.into();
    let mut seen = false;
    self.fields.retain_mut(|(k, v)| {
      if !k.eq_ignore_ascii_case(name) {
        return true;
      }
      if seen {
        return false;
      }
      seen = true;
      *v = value.clone();
      true
    });
    if !seen {
      self.fields.push((name.to_string(), value));
    }
  }

  /// Remove every field named `name`, returning how many were removed.
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.fields.len();
    self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    before - self.fields.len()
  }

  /// Iterate over `(name, value)` pairs in wire order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Returns true if a comma separated header (`Connection`, `Transfer-Encoding`)
  /// carries `token`.
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self
      .get_all(name)
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  }

  /// Returns true if the last transfer coding is `chunked`.
  pub(crate) fn is_chunked(&self) -> bool {
    self
      .get_all("transfer-encoding")
      .flat_map(|v| v.split(','))
      .last()
      .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
  }
}

impl fmt::Debug for Headers {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.iter()).finish()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Self {
      fields: iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    }
  }
}
