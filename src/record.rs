//! Reference logging hook: one JSON line per matching exchange.

use crate::config::LogConfig;
use crate::errors::{Error, Result};
use crate::flow::Flow;
use crate::headers::Headers;
use crate::hooks::{Control, Event, Hook};
use crate::request::split_host_port;
use crate::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Name the logger registers under.
pub const JSON_LOG_HOOK: &str = "json-log";

/// The request half of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// method
  pub method: String,
  /// header name → value; a repeated name keeps its last value
  pub headers: Map<String, Value>,
  /// full url
  pub url: String,
  /// decoded body
  pub text: String,
}

/// The response half of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// status code
  pub status_code: u16,
  /// header name → value; a repeated name keeps its last value
  pub headers: Map<String, Value>,
  /// cookie name → first value
  pub cookies: Map<String, Value>,
  /// decoded body
  pub text: String,
}

/// One logged exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
  /// seconds since the epoch when the record was made
  pub ts: f64,
  /// request
  pub request: RequestRecord,
  /// response
  pub response: ResponseRecord,
}

impl From<&Request> for RequestRecord {
  fn from(value: &Request) -> Self {
    Self {
      method: value.method().to_string(),
      headers: header_map(value.headers()),
      url: value.url(),
      text: value.text(),
    }
  }
}

impl From<&Response> for ResponseRecord {
  fn from(value: &Response) -> Self {
    Self {
      status_code: value.status_code().as_u16(),
      headers: header_map(value.headers()),
      cookies: value
        .cookies()
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect(),
      text: value.text(),
    }
  }
}

impl ExchangeRecord {
  /// Build a record for a flow that has a response.
  pub fn from_flow(flow: &Flow) -> Option<Self> {
    let response = flow.response.as_ref()?;
    let ts = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs_f64())
      .unwrap_or_default();
    Some(Self {
      ts,
      request: RequestRecord::from(&flow.request),
      response: ResponseRecord::from(response),
    })
  }
}

fn header_map(headers: &Headers) -> Map<String, Value> {
  let mut map = Map::new();
  for (k, v) in headers.iter() {
    map.insert(k.to_string(), Value::String(v.to_string()));
  }
  map
}

/// Appends an [`ExchangeRecord`] for every completed exchange whose request
/// host is on the allow-list.
#[derive(Debug)]
pub struct JsonLogHook {
  path: PathBuf,
  hosts: Vec<String>,
  // serializes appends so lines from concurrent connections never interleave
  write_lock: Mutex<()>,
}

impl JsonLogHook {
  /// Log exchanges for `hosts` to `path`.
  pub fn new(path: impl Into<PathBuf>, hosts: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
    Self {
      path: path.into(),
      hosts: hosts
        .into_iter()
        .map(|h| h.as_ref().trim().to_ascii_lowercase())
        .collect(),
      write_lock: Mutex::new(()),
    }
  }

  /// Build the logger from the `[log]` section.
  pub fn from_config(config: &LogConfig) -> Self {
    Self::new(config.path.clone(), &config.hosts)
  }

  /// The record file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Returns true if the request's `Host` is on the allow-list.
  ///
  /// The port is ignored and the comparison is ASCII case-insensitive.
  pub fn matches(&self, request: &Request) -> bool {
    let host = request
      .headers()
      .get("host")
      .map(str::trim)
      .unwrap_or_else(|| request.authority());
    let host = split_host_port(host).0;
    self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
  }

  /// Append one record as a JSON line.
  pub async fn append(&self, record: &ExchangeRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)
      .map_err(|e| Error::hook(JSON_LOG_HOOK, format!("serializing record: {}", e)))?;
    line.push(b'\n');
    let _guard = self.write_lock.lock().await;
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
  }
}

#[async_trait::async_trait]
impl Hook for JsonLogHook {
  async fn handle(&self, event: Event, flow: &mut Flow) -> Result<Control> {
    if event != Event::Response {
      return Ok(Control::Continue);
    }
    if !self.matches(&flow.request) {
      tracing::debug!(flow = %flow.id(), url = %flow.request.url(), "not logged: host filtered out");
      return Ok(Control::Continue);
    }
    let Some(record) = ExchangeRecord::from_flow(flow) else {
      return Ok(Control::Continue);
    };
    self
      .append(&record)
      .await
      .map_err(|e| Error::hook(JSON_LOG_HOOK, format!("{}: {}", self.path.display(), e)))?;
    Ok(Control::Continue)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::{ClientConn, FlowId};
  use http::{Method, StatusCode};

  fn flow(url: &str) -> Flow {
    let request = Request::new(Method::POST, url)
      .unwrap()
      .with_header("Content-Type", "application/json")
      .with_body("{\"q\":1}");
    let client = ClientConn {
      peer_addr: "127.0.0.1:1".parse().unwrap(),
      server_name: None,
    };
    let mut flow = Flow::new(FlowId { connection: 1, sequence: 1 }, request, client, None);
    flow.response = Some(
      Response::new(StatusCode::OK)
        .with_header("Set-Cookie", "a=1; Path=/")
        .with_header("Set-Cookie", "a=2")
        .with_header("X-Dup", "first")
        .with_header("X-Dup", "second")
        .with_body("{\"ok\":true}"),
    );
    flow
  }

  #[test]
  fn record_schema() {
    let record = ExchangeRecord::from_flow(&flow("https://clubhouse.pubnub.com/x")).unwrap();
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["request"]["method"], "POST");
    assert_eq!(value["request"]["url"], "https://clubhouse.pubnub.com/x");
    assert_eq!(value["request"]["text"], "{\"q\":1}");
    assert_eq!(value["response"]["status_code"], 200);
    assert_eq!(value["response"]["cookies"]["a"], "1");
    assert_eq!(value["response"]["headers"]["X-Dup"], "second");
    assert_eq!(value["response"]["text"], "{\"ok\":true}");
    assert!(value["ts"].as_f64().unwrap() > 0.0);
  }

  #[test]
  fn host_matching_ignores_port_and_case() {
    let hook = JsonLogHook::new("/dev/null", ["Clubhouse.PubNub.com"]);
    let request = Request::new(Method::GET, "https://clubhouse.pubnub.com:443/x").unwrap();
    assert!(hook.matches(&request));
    let request = Request::new(Method::GET, "https://example.com/").unwrap();
    assert!(!hook.matches(&request));
  }

  #[tokio::test]
  async fn appends_only_matching_exchanges() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flows.log");
    let hook = JsonLogHook::new(&path, crate::config::DEFAULT_LOG_HOSTS);

    let mut matching = flow("https://www.clubhouseapi.com/api/x");
    let mut other = flow("https://example.com/");
    hook.handle(Event::Request, &mut matching).await.unwrap();
    hook.handle(Event::Response, &mut other).await.unwrap();
    hook.handle(Event::Response, &mut matching).await.unwrap();
    hook.handle(Event::Response, &mut matching).await.unwrap();

    let content = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let record: ExchangeRecord = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record.request.url, "https://www.clubhouseapi.com/api/x");
  }

  #[tokio::test]
  async fn unwritable_log_is_a_hook_error() {
    let dir = tempfile::tempdir().unwrap();
    let hook = JsonLogHook::new(dir.path().join("missing").join("flows.log"), ["example.com"]);
    let mut flow = flow("https://example.com/");
    let err = hook.handle(Event::Response, &mut flow).await.err().unwrap();
    assert!(matches!(err, Error::Hook { .. }));
  }
}
