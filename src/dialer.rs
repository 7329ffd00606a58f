//! Egress dialer selection.
//!
//! Every outbound connection is opened by a dialer definition: directly from
//! this machine or through an upstream proxy, optionally restricted by a
//! request filter. The session ranks definitions by priority and hands the
//! round-tripper the next candidate until one produces a valid response or
//! the retry budget runs out.

use crate::errors::{new_io_error, Error, Result};
use crate::message::Request;
use base64::prelude::{Engine, BASE64_STANDARD};
use rand::Rng;
use regex::Regex;
use std::io::ErrorKind;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Header carrying the client-declared resource category, consumed by
/// filters and stripped before egress.
pub const RESOURCE_TYPE_HEADER: &str = "Resource-Type";
/// Header correlating a request with a named tape, stripped at the top of
/// the pipeline.
pub const TAPE_ID_HEADER: &str = "Tape-ID";

/// OR-filter deciding whether a dialer may serve a request.
///
/// Matches when the URL regex hits or when the request's resource type is in
/// the configured set. A definition without a filter matches everything.
#[derive(Debug, Clone)]
pub struct RequestFilter {
  url_regex: Option<Regex>,
  resource_types: Vec<String>,
}

impl RequestFilter {
  /// Compile a filter; a bad regex is a configuration error.
  pub fn new(url_regex: Option<&str>, resource_types: Vec<String>) -> Result<Self> {
    let url_regex = match url_regex {
      Some(pattern) => {
        Some(Regex::new(pattern).map_err(|e| Error::Config(format!("bad url regex: {}", e)))?)
      }
      None => None,
    };
    Ok(Self {
      url_regex,
      resource_types,
    })
  }

  /// OR semantics across the two conditions.
  pub fn matches(&self, url: &str, resource_type: &str) -> bool {
    if let Some(regex) = &self.url_regex {
      if regex.is_match(url) {
        return true;
      }
    }
    !resource_type.is_empty()
      && self
        .resource_types
        .iter()
        .any(|candidate| candidate == resource_type)
  }
}

/// An upstream proxy a dialer tunnels through.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
  url: http::Uri,
  username: Option<String>,
  password: Option<String>,
}

impl UpstreamProxy {
  /// Parse the proxy URL; blank credentials mean no authentication.
  pub fn new(url: &str, username: Option<String>, password: Option<String>) -> Result<Self> {
    let url: http::Uri = url
      .parse()
      .map_err(|e| Error::Config(format!("bad proxy url {}: {}", url, e)))?;
    if url.host().is_none() {
      return Err(Error::Config(format!("proxy url {} has no host", url)));
    }
    Ok(Self {
      url,
      username: username.filter(|v| !v.is_empty()),
      password: password.filter(|v| !v.is_empty()),
    })
  }

  fn address(&self) -> String {
    let host = self.url.host().unwrap_or_default();
    let port = self
      .url
      .port_u16()
      .unwrap_or(if self.url.scheme_str() == Some("https") {
        443
      } else {
        80
      });
    format!("{}:{}", host, port)
  }

  fn authorization(&self) -> Option<String> {
    match (&self.username, &self.password) {
      (Some(username), Some(password)) => Some(format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{}:{}", username, password))
      )),
      _ => None,
    }
  }
}

/// Resolve a dial address whose port token may be a scheme name.
///
/// The round-tripper derives addresses as `host:port`, falling back to the
/// scheme when the URL has no explicit port; the mapping to a numeric port
/// happens here at dial time.
fn resolve_port(addr: &str) -> Result<(String, u16)> {
  let (host, token) = addr
    .rsplit_once(':')
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "dial address without port"))?;
  let port = match token {
    "http" => 80,
    "https" => 443,
    other => other
      .parse::<u16>()
      .map_err(|_| new_io_error(ErrorKind::InvalidData, &format!("bad port token {:?}", other)))?,
  };
  Ok((host.to_string(), port))
}

/// A single egress route: identity, rank, optional upstream and filter.
#[derive(Debug)]
pub struct DialerDefinition {
  identifier: String,
  priority: i32,
  proxy: Option<UpstreamProxy>,
  filter: Option<RequestFilter>,
}

impl DialerDefinition {
  /// Create a definition with a fresh identifier.
  pub fn new(priority: i32, proxy: Option<UpstreamProxy>, filter: Option<RequestFilter>) -> Self {
    Self {
      identifier: uuid::Uuid::new_v4().to_string(),
      priority,
      proxy,
      filter,
    }
  }

  /// The passthrough route installed when no definitions are configured.
  pub fn passthrough() -> Self {
    Self::new(1, None, None)
  }

  /// Stable identifier for attempt tracking and transport caching.
  pub fn identifier(&self) -> &str {
    &self.identifier
  }

  /// Configured priority, higher wins.
  pub fn priority(&self) -> i32 {
    self.priority
  }

  fn accepts(&self, context: &DialerContext) -> bool {
    match &self.filter {
      None => true,
      Some(filter) => filter.matches(&context.url, &context.resource_type),
    }
  }

  /// Open a raw transport stream to `addr` (`host:port`, port possibly a
  /// scheme token), tunneling through the upstream proxy when configured.
  pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
    let (host, port) = resolve_port(addr)?;
    match &self.proxy {
      None => Ok(TcpStream::connect((host.as_str(), port)).await?),
      Some(proxy) => {
        let stream = TcpStream::connect(proxy.address()).await?;
        connect_through_proxy(stream, proxy, &format!("{}:{}", host, port)).await
      }
    }
  }
}

/// Exchange a CONNECT with the upstream proxy and hand back the tunneled
/// stream.
async fn connect_through_proxy(
  stream: TcpStream,
  proxy: &UpstreamProxy,
  target: &str,
) -> Result<TcpStream> {
  let mut raw = Vec::new();
  raw.extend_from_slice(format!("CONNECT {} HTTP/1.1\r\n", target).as_bytes());
  raw.extend_from_slice(format!("Host: {}\r\n", target).as_bytes());
  raw.extend_from_slice(b"Proxy-Connection: Keep-Alive\r\n");
  if let Some(authorization) = proxy.authorization() {
    raw.extend_from_slice(format!("Proxy-Authorization: {}\r\n", authorization).as_bytes());
  }
  raw.extend_from_slice(b"\r\n");

  let mut reader = BufReader::new(stream);
  reader.get_mut().write_all(&raw).await?;
  reader.get_mut().flush().await?;

  // status line plus headers; the proxy will not speak again until we do
  let mut status_line = String::new();
  reader.read_line(&mut status_line).await?;
  let ok = status_line
    .split_whitespace()
    .nth(1)
    .map(|code| code == "200")
    .unwrap_or(false);
  if !ok {
    return Err(new_io_error(
      ErrorKind::NotConnected,
      &format!("proxy refused connection: {}", status_line.trim()),
    ));
  }
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line == "\r\n" || line == "\n" {
      break;
    }
  }
  Ok(reader.into_inner())
}

/// Per-request dialing state.
#[derive(Debug)]
pub struct DialerContext {
  url: String,
  resource_type: String,
  attempted: Vec<String>,
  remaining: usize,
}

impl DialerContext {
  /// Identifiers of definitions already tried for this request.
  pub fn attempted(&self) -> &[String] {
    &self.attempted
  }

  /// Remaining retry budget.
  pub fn remaining(&self) -> usize {
    self.remaining
  }
}

struct SessionState {
  definitions: Vec<Arc<DialerDefinition>>,
  total_tries: usize,
}

/// The ordered set of egress routes, replaceable at runtime.
pub struct DialerSession {
  state: RwLock<SessionState>,
}

impl Default for DialerSession {
  fn default() -> Self {
    Self::new(vec![DialerDefinition::passthrough()], 0)
  }
}

impl DialerSession {
  /// Create a session; `total_tries == 0` means try every definition once.
  pub fn new(definitions: Vec<DialerDefinition>, total_tries: usize) -> Self {
    Self {
      state: RwLock::new(SessionState {
        definitions: definitions.into_iter().map(Arc::new).collect(),
        total_tries,
      }),
    }
  }

  /// Swap in a new definition list; an empty list installs the passthrough.
  pub fn replace(&self, definitions: Vec<DialerDefinition>) {
    let definitions = if definitions.is_empty() {
      vec![DialerDefinition::passthrough()]
    } else {
      definitions
    };
    let mut state = self.state.write().expect("dialer session poisoned");
    state.definitions = definitions.into_iter().map(Arc::new).collect();
  }

  /// Begin the dialing lifecycle for one request.
  pub fn new_context(&self, request: &Request) -> DialerContext {
    let state = self.state.read().expect("dialer session poisoned");
    let total_tries = if state.total_tries == 0 {
      state.definitions.len()
    } else {
      state.total_tries
    };
    let resource_type = request
      .headers()
      .get(RESOURCE_TYPE_HEADER)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string();
    DialerContext {
      url: request.url(),
      resource_type,
      attempted: Vec::new(),
      remaining: total_tries,
    }
  }

  /// The highest-priority untried definition matching the request, ties
  /// broken uniformly at random. Decrements the budget and records the
  /// attempt.
  pub fn next_dialer(&self, context: &mut DialerContext) -> Option<Arc<DialerDefinition>> {
    if context.remaining == 0 {
      return None;
    }
    let state = self.state.read().expect("dialer session poisoned");
    let candidates: Vec<&Arc<DialerDefinition>> = state
      .definitions
      .iter()
      .filter(|definition| definition.accepts(context))
      .filter(|definition| !context.attempted.contains(&definition.identifier))
      .collect();

    let max_priority = candidates.iter().map(|d| d.priority).max()?;
    let top: Vec<&Arc<DialerDefinition>> = candidates
      .into_iter()
      .filter(|d| d.priority == max_priority)
      .collect();
    let chosen = top[rand::thread_rng().gen_range(0..top.len())].clone();

    context.remaining -= 1;
    context.attempted.push(chosen.identifier.clone());
    debug!(
      "selected dialer {} (priority {}) for {}",
      chosen.identifier, chosen.priority, context.url
    );
    Some(chosen)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use http::{HeaderMap, HeaderValue, Method};

  fn request(url: &str, resource_type: Option<&str>) -> Request {
    let mut headers = HeaderMap::new();
    if let Some(rt) = resource_type {
      headers.insert(RESOURCE_TYPE_HEADER, HeaderValue::from_str(rt).unwrap());
    }
    Request::new(Method::GET, url.parse().unwrap(), headers, Bytes::new())
  }

  #[test]
  fn filter_or_semantics() {
    let filter =
      RequestFilter::new(Some(r".*\.png$"), vec!["script".to_string()]).unwrap();
    assert!(filter.matches("http://example.com/a.png", ""));
    assert!(filter.matches("http://example.com/app.js", "script"));
    assert!(!filter.matches("http://example.com/app.js", "image"));
  }

  #[test]
  fn bad_regex_is_config_error() {
    assert!(matches!(
      RequestFilter::new(Some("("), vec![]),
      Err(Error::Config(_))
    ));
  }

  #[test]
  fn priority_order_and_attempt_tracking() {
    let low = DialerDefinition::new(5, None, None);
    let high = DialerDefinition::new(10, None, None);
    let high_id = high.identifier().to_string();
    let low_id = low.identifier().to_string();
    let session = DialerSession::new(vec![low, high], 0);

    let mut context = session.new_context(&request("http://example.com/", None));
    let first = session.next_dialer(&mut context).unwrap();
    assert_eq!(first.identifier(), high_id);
    let second = session.next_dialer(&mut context).unwrap();
    assert_eq!(second.identifier(), low_id);
    assert!(session.next_dialer(&mut context).is_none());
    assert_eq!(context.attempted(), [high_id, low_id]);
  }

  #[test]
  fn filtered_definition_is_skipped() {
    let filtered = DialerDefinition::new(
      100,
      None,
      Some(RequestFilter::new(None, vec!["image".to_string()]).unwrap()),
    );
    let fallback = DialerDefinition::new(1, None, None);
    let fallback_id = fallback.identifier().to_string();
    let session = DialerSession::new(vec![filtered, fallback], 0);

    let mut context = session.new_context(&request("http://example.com/", Some("script")));
    let chosen = session.next_dialer(&mut context).unwrap();
    assert_eq!(chosen.identifier(), fallback_id);
  }

  #[test]
  fn total_tries_bounds_attempts() {
    let session = DialerSession::new(
      vec![
        DialerDefinition::new(1, None, None),
        DialerDefinition::new(1, None, None),
        DialerDefinition::new(1, None, None),
      ],
      2,
    );
    let mut context = session.new_context(&request("http://example.com/", None));
    assert!(session.next_dialer(&mut context).is_some());
    assert!(session.next_dialer(&mut context).is_some());
    assert!(session.next_dialer(&mut context).is_none());
  }

  #[test]
  fn empty_replace_installs_passthrough() {
    let session = DialerSession::default();
    session.replace(Vec::new());
    let mut context = session.new_context(&request("http://example.com/", None));
    let dialer = session.next_dialer(&mut context).unwrap();
    assert_eq!(dialer.priority(), 1);
  }

  #[test]
  fn resolve_port_handles_scheme_tokens() {
    assert_eq!(
      resolve_port("example.com:https").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(
      resolve_port("example.com:http").unwrap(),
      ("example.com".to_string(), 80)
    );
    assert_eq!(
      resolve_port("example.com:8443").unwrap(),
      ("example.com".to_string(), 8443)
    );
    assert!(resolve_port("example.com").is_err());
  }
}
