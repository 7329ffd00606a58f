//! Redirect-following fetch on top of the round-tripper.
//!
//! The pipeline needs every hop of a redirect chain, not just the final
//! response: each hop is cached and tape-logged on its own. The chain is an
//! owned oldest-first sequence built while following, so nothing holds
//! back-links.

use crate::errors::Result;
use crate::message::{Hop, Request};
use crate::transport::RoundTripper;
use http::{Method, StatusCode, Uri};
use std::sync::Arc;
use tracing::debug;

const MAX_REDIRECTS: usize = 10;

/// Resolve a `Location` value against the hop it came from.
fn resolve_location(base: &Uri, location: &Uri) -> Option<Uri> {
  if location.scheme().is_some() {
    return Some(location.clone());
  }
  let scheme = base.scheme_str()?;
  let authority = location
    .authority()
    .map(|a| a.as_str())
    .or_else(|| base.authority().map(|a| a.as_str()))?;
  let path = location.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let path = if path.starts_with('/') {
    path.to_string()
  } else {
    // relative reference, resolved against the base directory
    let base_path = base.path();
    let dir = base_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    format!("{}/{}", dir, path)
  };
  format!("{}://{}{}", scheme, authority, path).parse().ok()
}

/// Follows redirects and returns the full hop chain.
pub struct Fetcher {
  round_tripper: Arc<RoundTripper>,
}

impl Fetcher {
  /// Build over a round-tripper.
  pub fn new(round_tripper: Arc<RoundTripper>) -> Self {
    Self { round_tripper }
  }

  /// Fetch the request, following up to ten redirects.
  ///
  /// A failure anywhere in the chain fails the fetch; partial chains are not
  /// returned because the client never saw a response.
  pub async fn fetch(&self, request: &Request) -> Result<Vec<Hop>> {
    let mut hops: Vec<Hop> = Vec::new();
    let mut current = request.clone();
    loop {
      let response = self.round_tripper.round_trip(&current).await?;

      let next = if hops.len() < MAX_REDIRECTS && response.status_code().is_redirection() {
        response
          .location()
          .and_then(|location| resolve_location(current.uri(), &location))
      } else {
        None
      };

      let next = match next {
        Some(next) => next,
        None => {
          hops.push(Hop {
            request: current,
            response,
          });
          return Ok(hops);
        }
      };

      debug!("redirect {} -> {}", current.url(), next);
      let mut follow_up = current.clone();
      hops.push(Hop {
        request: current,
        response: response.clone(),
      });

      match response.status_code() {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
          // these rewrite to a body-less GET
          if follow_up.method() != Method::GET && follow_up.method() != Method::HEAD {
            *follow_up.method_mut() = Method::GET;
          }
          *follow_up.body_mut() = bytes::Bytes::new();
          for header in [
            http::header::TRANSFER_ENCODING,
            http::header::CONTENT_ENCODING,
            http::header::CONTENT_TYPE,
            http::header::CONTENT_LENGTH,
          ] {
            follow_up.headers_mut().remove(header);
          }
        }
        _ => {}
      }
      // the Host of the previous hop must not leak to the next
      follow_up.headers_mut().remove(http::header::HOST);
      *follow_up.uri_mut() = next;
      current = follow_up;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn absolute_location_wins() {
    let base: Uri = "http://a.example/x".parse().unwrap();
    let location: Uri = "https://b.example/y".parse().unwrap();
    assert_eq!(
      resolve_location(&base, &location).unwrap().to_string(),
      "https://b.example/y"
    );
  }

  #[test]
  fn rooted_location_keeps_authority() {
    let base: Uri = "http://a.example/x/y?q=1".parse().unwrap();
    let location: Uri = "/z".parse().unwrap();
    assert_eq!(
      resolve_location(&base, &location).unwrap().to_string(),
      "http://a.example/z"
    );
  }

  #[test]
  fn relative_location_resolves_against_directory() {
    let base: Uri = "http://a.example/dir/page".parse().unwrap();
    let location: Uri = "other".parse().unwrap();
    assert_eq!(
      resolve_location(&base, &location).unwrap().to_string(),
      "http://a.example/dir/other"
    );
  }
}
