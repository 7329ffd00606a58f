//! The fixed-order middleware pipeline.
//!
//! Request path: header extraction, then tape, then cache, then egress.
//! Response path: cache store + lock release, then tape logging. The order
//! guarantees control headers are off the wire before any caching decision,
//! that a replayed tape bypasses the cache, and that a cache hit records
//! nothing new.

use crate::cache::{CacheEntry, CacheLayer};
use crate::dialer::TAPE_ID_HEADER;
use crate::fetch::Fetcher;
use crate::message::{Request, Response};
use crate::recorder::{Recorder, RecorderMode};
use http::StatusCode;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Body served when replay finds no matching record.
pub const BLOCKED_BODY: &str = "Proxy blocked request";

/// Everything one request needs, threaded explicitly instead of living in
/// globals. The control plane shares these collaborators and serializes its
/// mutations through their own locks.
pub struct Pipeline {
  recorder: Arc<RwLock<Recorder>>,
  cache: Arc<CacheLayer>,
  fetcher: Fetcher,
}

impl Pipeline {
  /// Assemble the pipeline.
  pub fn new(recorder: Arc<RwLock<Recorder>>, cache: Arc<CacheLayer>, fetcher: Fetcher) -> Self {
    Self {
      recorder,
      cache,
      fetcher,
    }
  }

  /// Run one request through the middleware chain to a response.
  ///
  /// Never fails: every error becomes a synthesized 5xx so the client always
  /// receives an HTTP answer.
  pub async fn handle(&self, mut request: Request) -> Response {
    // headers middleware: pull control metadata off the request.
    // Resource-Type stays for the dialer filters and is stripped at egress.
    let tape_id = request
      .headers()
      .get(TAPE_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string();
    request.headers_mut().remove(TAPE_ID_HEADER);

    // mode snapshots; in-flight requests are immune to control-plane flips
    let recorder_mode = self.recorder.read().expect("recorder poisoned").mode();
    let cache_mode = self.cache.mode();

    if recorder_mode == RecorderMode::Read {
      return self.replay(&request, &tape_id);
    }

    if let Some(entry) = self.cache.get_contents(cache_mode, &request).await {
      return entry_response(entry);
    }

    let url = request.url();
    self.cache.acquire_url_lock(cache_mode, &url).await;
    // the primary may have filled the cache while this caller was parked
    if let Some(entry) = self.cache.get_contents(cache_mode, &request).await {
      self.cache.release_url_lock(&url);
      return entry_response(entry);
    }

    match self.fetcher.fetch(&request).await {
      Err(err) => {
        let reason = err.to_string();
        self.cache.set_failed(cache_mode, &request, &reason).await;
        self.cache.release_url_lock(&url);
        Response::synthetic(StatusCode::BAD_GATEWAY, &reason)
      }
      Ok(hops) => {
        // oldest hop first; only the first hop ever held the URL lock, the
        // extra releases are no-ops by contract
        for hop in &hops {
          self
            .cache
            .set_valid(cache_mode, &hop.request, &hop.response)
            .await;
          self.cache.release_url_lock(&hop.request.url());
        }
        if recorder_mode == RecorderMode::Write {
          let mut recorder = self.recorder.write().expect("recorder poisoned");
          for hop in &hops {
            recorder.log_pair(&hop.request, &hop.response, &tape_id);
          }
        }
        match hops.last() {
          Some(hop) => hop.response.clone(),
          None => Response::synthetic(StatusCode::BAD_GATEWAY, "empty fetch"),
        }
      }
    }
  }

  fn replay(&self, request: &Request, tape_id: &str) -> Response {
    let matched = self
      .recorder
      .write()
      .expect("recorder poisoned")
      .find_matching_response(request, tape_id);
    match matched {
      Some(response) => {
        debug!("tape record found: {}", request.url());
        response
      }
      None => {
        debug!("no matching tape record: {}", request.url());
        Response::synthetic(StatusCode::INTERNAL_SERVER_ERROR, BLOCKED_BODY)
      }
    }
  }
}

fn entry_response(entry: CacheEntry) -> Response {
  match (entry.value, entry.error) {
    (Some(archived), _) => archived.to_response().unwrap_or_else(|err| {
      Response::synthetic(StatusCode::BAD_GATEWAY, &err.to_string())
    }),
    (None, Some(error)) => Response::synthetic(StatusCode::BAD_GATEWAY, &error),
    (None, None) => Response::synthetic(StatusCode::BAD_GATEWAY, "empty cache entry"),
  }
}
