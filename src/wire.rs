//! HTTP/1.1 wire codec.
//!
//! Both sides of the proxy speak HTTP/1.1 over buffered tokio streams: the
//! MITM acceptor parses client requests off the (possibly TLS-wrapped)
//! connection, and the HTTP/1.1 transports parse origin responses. Bodies are
//! always read to completion, since the pipeline archives full exchanges.

use crate::errors::{new_io_error, Error, Result};
use crate::message::{Request, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;

pub(crate) fn parse_header_line(
  buffer: &[u8],
) -> Result<(Option<HeaderName>, Option<HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(b"\r\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, part) in buffer.splitn(2, |b| *b == b':').enumerate() {
    let part = part.strip_prefix(b" ").unwrap_or(part);
    match index {
      0 => k = Some(HeaderName::from_bytes(part)?),
      1 => v = Some(HeaderValue::from_bytes(part)?),
      _ => {}
    }
  }
  Ok((k, v))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEADER_BYTES {
      return Err(Error::InvalidRequest("headers exceed maximum size".into()));
    }
    if let (Some(k), Some(v)) = parse_header_line(&line)? {
      headers.append(k, v);
    }
  }
  Ok(headers)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    reader.read_until(b'\n', &mut size_line).await?;
    let size_text = String::from_utf8_lossy(&size_line);
    let size_text = size_text.trim();
    // chunk extensions after ';' are ignored
    let size_token = size_text.split(';').next().unwrap_or_default();
    let size = usize::from_str_radix(size_token, 16)
      .map_err(|_| Error::InvalidRequest(format!("bad chunk size {:?}", size_token)))?;
    if size == 0 {
      // trailing CRLF (and any trailers) up to the blank line
      let mut trailer = Vec::new();
      loop {
        trailer.clear();
        let n = reader.read_until(b'\n', &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.extend_from_slice(&chunk);
    // chunk data is followed by CRLF
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

/// Read one request off a client connection.
///
/// Returns `Ok(None)` on clean EOF between requests, which ends a keep-alive
/// loop without error. `scheme` and `default_authority` reconstruct a full
/// URI for origin-form targets (inside a CONNECT tunnel the client only sends
/// the path).
pub async fn read_request<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  scheme: &str,
  default_authority: Option<&str>,
) -> Result<Option<Request>> {
  let mut request_line = Vec::new();
  let n = reader.read_until(b'\n', &mut request_line).await?;
  if n == 0 {
    return Ok(None);
  }
  if request_line.len() > MAX_REQUEST_LINE {
    return Err(Error::InvalidRequest("request line too long".into()));
  }
  let line = String::from_utf8_lossy(&request_line);
  let mut parts = line.split_whitespace();
  let (method, target) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(_version)) => (Method::from_bytes(m.as_bytes())?, t.to_string()),
    _ => return Err(Error::InvalidRequest(format!("bad request line {:?}", line.trim()))),
  };

  let headers = read_headers(reader).await?;

  let uri: Uri = if method == Method::CONNECT {
    // authority-form, keep as-is
    target.parse()?
  } else if target.starts_with("http://") || target.starts_with("https://") {
    target.parse()?
  } else {
    let authority = headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_string())
      .or_else(|| default_authority.map(|v| v.to_string()))
      .ok_or_else(|| Error::InvalidRequest("no host for origin-form request".into()))?;
    format!("{}://{}{}", scheme, authority, target).parse()?
  };

  let body = if is_chunked(&headers) {
    read_chunked_body(reader).await?
  } else if let Some(len) = content_length(&headers) {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    body
  } else {
    Vec::new()
  };

  Ok(Some(Request::new(method, uri, headers, Bytes::from(body))))
}

/// Read one response off an origin connection.
///
/// `request_method` controls body framing: HEAD responses carry headers only.
pub async fn read_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  request_method: &Method,
) -> Result<Response> {
  let mut status_line = Vec::new();
  let n = reader.read_until(b'\n', &mut status_line).await?;
  if n == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed before status line",
    ));
  }
  let line = String::from_utf8_lossy(&status_line);
  let mut parts = line.split_whitespace();
  let version = match parts.next() {
    Some("HTTP/1.0") => Version::HTTP_10,
    Some("HTTP/1.1") => Version::HTTP_11,
    Some(other) => {
      return Err(Error::InvalidRequest(format!("bad http version {:?}", other)));
    }
    None => return Err(Error::InvalidRequest("empty status line".into())),
  };
  let status = parts
    .next()
    .ok_or_else(|| Error::InvalidRequest("status line missing code".into()))
    .and_then(|code| StatusCode::from_bytes(code.as_bytes()).map_err(Error::from))?;

  let headers = read_headers(reader).await?;

  let no_body = request_method == Method::HEAD
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || status.is_informational();

  let body = if no_body {
    Vec::new()
  } else if is_chunked(&headers) {
    read_chunked_body(reader).await?
  } else if let Some(len) = content_length(&headers) {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    body
  } else {
    // close-delimited body
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    body
  };

  debug_assert!(matches!(version, Version::HTTP_10 | Version::HTTP_11));
  Ok(Response::new(status, headers, Bytes::from(body)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_origin_form_request() {
    let raw = b"GET /path?a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = read_request(&mut reader, "http", None).await.unwrap().unwrap();
    assert_eq!(request.method(), &Method::GET);
    assert_eq!(request.url(), "http://example.com/path?a=1");
  }

  #[tokio::test]
  async fn parses_connect_request() {
    let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = read_request(&mut reader, "https", None).await.unwrap().unwrap();
    assert_eq!(request.method(), &Method::CONNECT);
    assert_eq!(request.uri().to_string(), "example.com:443");
  }

  #[tokio::test]
  async fn eof_between_requests_is_none() {
    let raw: &[u8] = b"";
    let mut reader = BufReader::new(raw);
    assert!(read_request(&mut reader, "http", None).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn parses_content_length_response() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhello";
    let mut reader = BufReader::new(&raw[..]);
    let response = read_response(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"hello");
    assert_eq!(response.headers().get("x-test").unwrap(), "yes");
  }

  #[tokio::test]
  async fn parses_chunked_response() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let response = read_response(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(response.body().as_ref(), b"hello world");
  }

  #[tokio::test]
  async fn close_delimited_body_reads_to_eof() {
    let raw = b"HTTP/1.1 200 OK\r\n\r\neverything until eof";
    let mut reader = BufReader::new(&raw[..]);
    let response = read_response(&mut reader, &Method::GET).await.unwrap();
    assert_eq!(response.body().as_ref(), b"everything until eof");
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let response = read_response(&mut reader, &Method::HEAD).await.unwrap();
    assert!(response.body().is_empty());
  }
}
