use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

/// A request flowing through the proxy pipeline.
///
/// Wraps the `http` crate types with a fully buffered body. The proxy always
/// materializes bodies: every request may end up archived on the tape or in
/// the cache, both of which need the complete bytes.
#[derive(Debug, Default, Clone)]
pub struct Request {
  uri: Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl<T> From<http::Request<T>> for Request
where
  Bytes: From<T>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: Bytes::from(body),
    }
  }
}

impl Request {
  /// Create a request from its components.
  pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
    Self {
      uri,
      version: Version::HTTP_11,
      method,
      headers,
      body,
    }
  }
  /// Serialize as an HTTP/1.1 request head plus body.
  ///
  /// A `Host` header is synthesized from the URI authority when absent, and
  /// `Content-Length` is filled in for non-empty bodies.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      raw.extend(b"?");
      raw.extend(q.as_bytes());
    }
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      raw.extend(http::header::HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      if let Some(a) = self.uri.authority() {
        raw.extend(a.as_str().as_bytes());
      }
      raw.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if !self.body.is_empty() {
      headers
        .entry(http::header::CONTENT_LENGTH)
        .or_insert(HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if !self.body.is_empty() {
      raw.extend(self.body.as_ref());
    }
    Bytes::from(raw)
  }
  /// The full request URL as a string, the identity used by URL locks and
  /// tape matching.
  pub fn url(&self) -> String {
    self.uri.to_string()
  }
  /// Returns the associated uri.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Returns a mutable reference to the associated uri.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }
  /// Returns the associated method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Returns a mutable reference to the associated method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns the associated header map.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Returns a mutable reference to the associated header map.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Returns the buffered body.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Replace the buffered body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Bytes {
    &mut self.body
  }
}

/// A response flowing back through the proxy pipeline.
#[derive(Debug, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Default for Response {
  fn default() -> Self {
    Self {
      version: Version::HTTP_11,
      status_code: StatusCode::OK,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }
}

impl<T> From<http::Response<T>> for Response
where
  Bytes: From<T>,
{
  fn from(value: http::Response<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: Bytes::from(body),
    }
  }
}

impl Response {
  /// Create a response from its components.
  pub fn new(status_code: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
    Self {
      version: Version::HTTP_11,
      status_code,
      headers,
      body,
    }
  }
  /// A proxy-generated plain-text response, used for replay misses and
  /// egress failures.
  pub fn synthetic(status_code: StatusCode, body: &str) -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Self {
      version: Version::HTTP_11,
      status_code,
      headers,
      body: Bytes::copy_from_slice(body.as_bytes()),
    }
  }
  /// Serialize as an HTTP/1.1 response for the client side of the tunnel.
  ///
  /// The body is written verbatim with an explicit `Content-Length`; hop
  /// framing headers from the origin no longer apply to the re-encoded
  /// exchange. Responses whose body is suppressed by the request method or
  /// status (HEAD, 204, 304, 1xx) keep the origin's declared entity length
  /// instead: a HEAD response must report the length the equivalent GET
  /// would have carried.
  pub fn to_raw(&self, request_method: &Method) -> Bytes {
    let suppressed = request_method == Method::HEAD
      || self.status_code == StatusCode::NO_CONTENT
      || self.status_code == StatusCode::NOT_MODIFIED
      || self.status_code.is_informational();

    let mut raw = Vec::new();
    raw.extend(b"HTTP/1.1 ");
    raw.extend(self.status_code.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(
      self
        .status_code
        .canonical_reason()
        .unwrap_or("Unknown")
        .as_bytes(),
    );
    raw.extend(CR_LF);
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    if !suppressed {
      headers.remove(http::header::CONTENT_LENGTH);
    }
    for (k, v) in headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    if !suppressed {
      raw.extend(http::header::CONTENT_LENGTH.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(self.body.len().to_string().as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if !suppressed {
      raw.extend(self.body.as_ref());
    }
    Bytes::from(raw)
  }
  /// Returns the status code.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Returns the http version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns the associated header map.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Returns a mutable reference to the associated header map.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Returns the buffered body.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// The `Location` header parsed as a target for redirect handling.
  pub fn location(&self) -> Option<Uri> {
    self
      .headers
      .get(http::header::LOCATION)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<Uri>().ok())
  }
}

/// One request/response exchange.
///
/// A fetch that followed redirects produces several of these, oldest hop
/// first. Modeled as owned pairs rather than response→request back-links so
/// the chain has a single owner.
#[derive(Debug, Clone)]
pub struct Hop {
  /// the request as it left the proxy
  pub request: Request,
  /// the response for that exact hop
  pub response: Response,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_to_raw_adds_host_and_length() {
    let req = Request::new(
      Method::POST,
      "http://example.com/submit?x=1".parse().unwrap(),
      HeaderMap::new(),
      Bytes::from_static(b"hello"),
    );
    let raw = req.to_raw();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("POST /submit?x=1 HTTP/1.1\r\n"));
    assert!(text.contains("host: example.com\r\n"));
    assert!(text.contains("content-length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
  }

  #[test]
  fn response_to_raw_rewrites_framing() {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::TRANSFER_ENCODING,
      HeaderValue::from_static("chunked"),
    );
    let resp = Response::new(StatusCode::OK, headers, Bytes::from_static(b"abc"));
    let raw = resp.to_raw(&Method::GET);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!text.contains("transfer-encoding"));
    assert!(text.contains("content-length: 3\r\n"));
  }

  #[test]
  fn head_response_keeps_origin_content_length() {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_LENGTH,
      HeaderValue::from_static("1234"),
    );
    let resp = Response::new(StatusCode::OK, headers, Bytes::new());
    let raw = resp.to_raw(&Method::HEAD);
    let text = String::from_utf8_lossy(&raw);
    // the equivalent GET's length survives and no body follows
    assert!(text.contains("content-length: 1234\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[test]
  fn no_content_response_carries_no_body() {
    let resp = Response::new(
      StatusCode::NO_CONTENT,
      HeaderMap::new(),
      Bytes::from_static(b"stray"),
    );
    let raw = resp.to_raw(&Method::GET);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(!text.contains("content-length"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[test]
  fn synthetic_response_carries_body() {
    let resp = Response::synthetic(StatusCode::INTERNAL_SERVER_ERROR, "Proxy blocked request");
    assert_eq!(resp.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.body().as_ref(), b"Proxy blocked request");
  }
}
