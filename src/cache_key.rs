//! Request fingerprints.
//!
//! The cache identity of a request: method, hostname, path and the query
//! pairs sorted by (key, value), collapsed into an opaque token. Scheme and
//! port are left out on purpose so `http`/`https` and default-port variants
//! of the same resource share one cache entry.

use crate::message::Request;
use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};

fn query_pairs(query: &str) -> Vec<(String, String)> {
  let mut pairs: Vec<(String, String)> = query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| match pair.split_once('=') {
      Some((k, v)) => (k.to_string(), v.to_string()),
      None => (pair.to_string(), String::new()),
    })
    .collect();
  pairs.sort();
  pairs
}

/// Compute the fingerprint token for a request.
///
/// Equal for logically equivalent requests: same method, host, path and
/// query multiset, regardless of parameter order.
pub fn fingerprint(request: &Request) -> String {
  let uri = request.uri();
  let mut canonical = String::new();
  canonical.push_str(request.method().as_str());
  canonical.push('-');
  canonical.push_str(uri.host().unwrap_or_default());
  canonical.push_str(uri.path());
  canonical.push('-');
  for (key, value) in query_pairs(uri.query().unwrap_or_default()) {
    canonical.push_str(&key);
    canonical.push('=');
    canonical.push_str(&value);
    canonical.push('&');
  }
  // url-safe alphabet keeps the token usable as a disk-store file name
  BASE64_URL_SAFE_NO_PAD.encode(canonical.as_bytes())
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use http::{HeaderMap, Method};

  fn request(method: Method, url: &str) -> Request {
    Request::new(method, url.parse().unwrap(), HeaderMap::new(), Bytes::new())
  }

  #[test]
  fn query_order_is_ignored() {
    let a = request(Method::GET, "http://example.com/?a=1&b=2");
    let b = request(Method::GET, "http://example.com/?b=2&a=1");
    assert_eq!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn hosts_differ() {
    let a = request(Method::GET, "http://example.com/");
    let b = request(Method::GET, "http://example.net/");
    assert_ne!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn methods_differ() {
    let a = request(Method::GET, "http://example.com/");
    let b = request(Method::POST, "http://example.com/");
    assert_ne!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn scheme_and_default_port_collapse() {
    let a = request(Method::GET, "http://example.com/x");
    let b = request(Method::GET, "https://example.com/x");
    let c = request(Method::GET, "https://example.com:443/x");
    assert_eq!(fingerprint(&a), fingerprint(&b));
    assert_eq!(fingerprint(&b), fingerprint(&c));
  }

  #[test]
  fn repeated_query_keys_are_a_multiset() {
    let a = request(Method::GET, "http://example.com/?k=2&k=1");
    let b = request(Method::GET, "http://example.com/?k=1&k=2");
    let c = request(Method::GET, "http://example.com/?k=1");
    assert_eq!(fingerprint(&a), fingerprint(&b));
    assert_ne!(fingerprint(&a), fingerprint(&c));
  }
}
