//! Archived request/response pairs.
//!
//! The wire form shared by the tape file format and the client bindings:
//! JSON objects with header multimaps and base64 bodies. Conversions to and
//! from the pipeline [`Request`]/[`Response`] types live here so the recorder
//! and cache never touch raw header maps themselves.

use crate::message::{Request, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub(crate) mod base64_bytes {
  use base64::prelude::{Engine, BASE64_STANDARD};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    BASE64_STANDARD
      .decode(text.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}

/// A captured request: URL, method, header multimap and body.
///
/// Immutable once captured; replacing a record means archiving a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedRequest {
  /// full request url
  pub url: String,
  /// request method
  pub method: String,
  /// header name to ordered values
  pub headers: BTreeMap<String, Vec<String>>,
  /// raw body bytes, base64 in the JSON form
  #[serde(with = "base64_bytes")]
  pub body: Vec<u8>,
}

/// A captured response: status, header multimap and body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedResponse {
  /// numeric status code
  pub status: u16,
  /// header name to ordered values
  pub headers: BTreeMap<String, Vec<String>>,
  /// raw body bytes, base64 in the JSON form
  #[serde(with = "base64_bytes")]
  pub body: Vec<u8>,
}

/// One tape entry: the pair plus the tape partition it belongs to.
///
/// An empty `tape_id` marks traffic from clients that could not attach the
/// control header; exports include those conservatively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedRecord {
  /// archived request
  pub request: ArchivedRequest,
  /// archived response
  pub response: ArchivedResponse,
  /// tape partition tag, empty for untagged traffic
  #[serde(default)]
  pub tape_id: String,
}

fn headers_to_multimap(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
  let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
  for name in headers.keys() {
    let values = headers
      .get_all(name)
      .iter()
      .filter_map(|v| v.to_str().ok().map(|v| v.to_string()))
      .collect();
    map.insert(name.as_str().to_string(), values);
  }
  map
}

fn multimap_to_headers(map: &BTreeMap<String, Vec<String>>) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for (name, values) in map {
    if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
      for value in values {
        if let Ok(value) = HeaderValue::from_str(value) {
          headers.append(name.clone(), value);
        }
      }
    }
  }
  headers
}

impl From<&Request> for ArchivedRequest {
  fn from(request: &Request) -> Self {
    Self {
      url: request.url(),
      method: request.method().to_string(),
      headers: headers_to_multimap(request.headers()),
      body: request.body().to_vec(),
    }
  }
}

impl From<&Response> for ArchivedResponse {
  fn from(response: &Response) -> Self {
    Self {
      status: response.status_code().as_u16(),
      headers: headers_to_multimap(response.headers()),
      body: response.body().to_vec(),
    }
  }
}

impl ArchivedRequest {
  /// Rebuild a pipeline request, used when replaying a tape entry needs the
  /// original request context.
  pub fn to_request(&self) -> crate::Result<Request> {
    let uri: Uri = self.url.parse()?;
    let method = Method::from_bytes(self.method.as_bytes())?;
    Ok(Request::new(
      method,
      uri,
      multimap_to_headers(&self.headers),
      Bytes::from(self.body.clone()),
    ))
  }
}

impl ArchivedResponse {
  /// Rebuild a pipeline response from the archived form.
  pub fn to_response(&self) -> crate::Result<Response> {
    let status = StatusCode::from_u16(self.status).map_err(http::Error::from)?;
    Ok(Response::new(
      status,
      multimap_to_headers(&self.headers),
      Bytes::from(self.body.clone()),
    ))
  }
}
