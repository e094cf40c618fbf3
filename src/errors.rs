//! Error types for the interception engine

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `flowtap::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Root certificate material is missing or unusable, or a leaf could not be issued.
  #[error("CA error: {0}")]
  Ca(String),

  /// The listener failed to accept a connection.
  #[error("accept error: {0}")]
  Accept(io::Error),

  /// Either leg of the interception failed its TLS handshake.
  #[error("TLS handshake error: {0}")]
  TlsHandshake(String),

  /// A message on the wire could not be parsed.
  ///
  /// `recoverable` is true when the parser consumed the whole message head and
  /// the stream is still positioned on a message boundary.
  #[error("malformed message: {reason}")]
  MalformedMessage {
    /// what was wrong with the message
    reason: String,
    /// whether the connection can carry another message
    recoverable: bool,
  },

  /// Writing a message to a peer failed.
  #[error("forward error: {0}")]
  Forward(io::Error),

  /// A hook returned an error.
  #[error("hook `{name}` failed: {message}")]
  Hook {
    /// registration name of the hook
    name: String,
    /// rendered error
    message: String,
  },

  /// The configuration could not be loaded.
  #[error("config error: {0}")]
  Config(String),

  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),

  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
}

impl Error {
  /// Create a CA error and log it
  pub fn ca(msg: impl Into<String>) -> Self {
    let error = Error::Ca(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a malformed message error that leaves the stream unusable
  pub fn malformed(msg: impl Into<String>) -> Self {
    Error::MalformedMessage {
      reason: msg.into(),
      recoverable: false,
    }
  }

  /// Create a malformed message error after which the stream is still on a message boundary
  pub fn malformed_recoverable(msg: impl Into<String>) -> Self {
    Error::MalformedMessage {
      reason: msg.into(),
      recoverable: true,
    }
  }

  /// Create a hook error
  pub fn hook(name: impl Into<String>, msg: impl ToString) -> Self {
    Error::Hook {
      name: name.into(),
      message: msg.to_string(),
    }
  }

  /// Create a config error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Returns true if the connection that produced this error must be torn down.
  ///
  /// Only recoverable malformed messages and hook failures leave the connection usable.
  pub fn is_fatal_to_connection(&self) -> bool {
    match self {
      Error::MalformedMessage { recoverable, .. } => !recoverable,
      Error::Hook { .. } => false,
      _ => true,
    }
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::TlsHandshake(value.to_string())
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Ca(value.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_connection_fatality() {
    assert!(!Error::malformed_recoverable("bad header").is_fatal_to_connection());
    assert!(Error::malformed("eof inside chunk").is_fatal_to_connection());
    assert!(!Error::hook("logger", "disk full").is_fatal_to_connection());
    assert!(Error::Forward(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal_to_connection());
  }

  #[test]
  fn hook_error_renders_name() {
    let err = Error::hook("logger", "disk full");
    assert_eq!(err.to_string(), "hook `logger` failed: disk full");
  }
}
