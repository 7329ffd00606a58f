#![deny(missing_docs)]

//! # vinylproxy
//!
//! A programmable man-in-the-middle HTTP/HTTPS forward proxy for automated
//! browser testing, scraping and benchmarking. Clients route traffic through
//! it; the proxy terminates TLS with a locally trusted CA, inspects every
//! exchange, and can
//!
//! - replay previously recorded traffic from a [tape](recorder::Recorder),
//! - serve from a [two-tier cache](cache::CacheLayer) while coalescing
//!   duplicate in-flight requests,
//! - route each request through a pool of
//!   [egress dialers](dialer::DialerSession) picked by priority and
//!   URL/resource-type filters,
//! - mimic a real browser's TLS ClientHello to dodge fingerprint-based
//!   blocking.
//!
//! The data plane is a forward proxy (default port 6010, `CONNECT` is always
//! intercepted) and the control plane is a small HTTP API (default port
//! 6011) that flips modes, loads tapes and swaps dialer definitions between
//! test runs.
//!
//! Clients may attach two control headers, stripped before egress:
//! `Tape-ID` names the tape partition a request belongs to and
//! `Resource-Type` carries the browser's resource category for dialer
//! filters.

pub mod archive;
pub mod cache;
pub mod cache_key;
pub mod certs;
pub mod control;
pub mod dialer;
mod errors;
pub mod fetch;
pub mod lru;
/// Request/response types flowing through the proxy pipeline.
pub mod message;
pub mod mimic;
pub mod pipeline;
pub mod proxy;
pub mod recorder;
pub mod store;
pub mod transport;
pub mod wire;

pub use cache::{CacheLayer, CacheMode};
pub use certs::{CertStore, CertificateAuthority};
pub use dialer::{DialerDefinition, DialerSession};
pub use errors::{Error, Result};
pub use message::{Hop, Request, Response};
pub use pipeline::Pipeline;
pub use proxy::ProxyServer;
pub use recorder::{Recorder, RecorderMode};
pub use transport::RoundTripper;

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const SPACE: &[u8] = b" ";
pub(crate) const COLON_SPACE: &[u8] = b": ";

/// Default data-plane port.
pub const DEFAULT_PORT: u16 = 6010;
/// Default control-plane port.
pub const DEFAULT_CONTROL_PORT: u16 = 6011;
