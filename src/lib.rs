#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # flowtap
//!
//! The `flowtap` crate is the core of a transparent, TLS-intercepting HTTP
//! proxy. Connections redirected to its listening socket are terminated with
//! leaf certificates issued on the fly by a local [`CertificateAuthority`],
//! parsed as HTTP/1.x, passed through registered [hooks](hooks) and forwarded
//! to the real origin over a second, independently verified TLS session.
//!
//! - Per-host leaf certificates, issued once and cached for the process
//! - Original destination recovery (`SO_ORIGINAL_DST`) or a fixed upstream
//! - Plain HTTP on the same port, detected from the first byte
//! - Ordered request / response / error hooks that may edit flows in place
//! - Byte-exact passthrough of messages no hook touched
//!
//! ## Registering a hook
//!
//! ```rust
//! use flowtap::hooks::{Control, Event, HookRegistry};
//!
//! let mut hooks = HookRegistry::new();
//! hooks.register_fn(Event::Request, "strip-ua", |_, flow| {
//!   flow.request.headers_mut().remove("user-agent");
//!   Ok(Control::Continue)
//! });
//! assert_eq!(hooks.count(Event::Request), 1);
//! ```
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! # async fn run() -> flowtap::Result<()> {
//! let config = flowtap::ProxyConfig::load("flowtap.toml")?;
//! let hooks = flowtap::server::default_hooks(&config);
//! flowtap::ProxyServer::from_config(&config, hooks).await?.run().await
//! # }
//! ```
//!
//! The reference hook, [`record::JsonLogHook`], appends one JSON object per
//! exchange with an allow-listed host to a log file.
//!
//! ## Optional Features
//!
//! - **charset**: Decode bodies using the `charset` of `Content-Type` when rendering text.
//! - **gzip**: Undo gzip / deflate content-encoding when rendering text.
//!
/// Original destination recovery and the listening socket
pub mod acceptor;
mod body;
/// Root and leaf certificates
pub mod ca;
/// Configuration file
pub mod config;
mod cookies;
mod errors;
/// Flows and their metadata
pub mod flow;
/// Writing messages to peers
pub mod forward;
mod headers;
/// Hook registry and dispatch
pub mod hooks;
/// HTTP/1.x message reading
pub mod parser;
/// Reference JSON logging hook
pub mod record;
mod request;
mod response;
/// Accept loop and connection pipeline
pub mod server;
mod socket;
/// TLS interception
pub mod tls;

pub use acceptor::{Acceptor, Connection, Destination, DestinationLookup};
pub use body::Body;
pub use ca::{CertificateAuthority, LeafCertificate};
pub use config::ProxyConfig;
pub use errors::{Error, Result};
pub use flow::{Flow, FlowId};
pub use forward::Forwarder;
pub use headers::Headers;
pub use hooks::{Control, Event, Hook, HookRegistry};
pub use http::{Method, StatusCode, Version};
pub use parser::MessageReader;
pub use request::Request;
pub use response::Response;
pub use server::ProxyServer;
pub use socket::Socket;
pub use tls::{OriginVerification, TlsInterceptor};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
