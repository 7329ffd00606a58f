//! Cache layer: modes, cache-control evaluation and single-flight locks.
//!
//! Sits between the tape and the egress fetch. Entries are keyed by the
//! request fingerprint and stored through the two-tier [`TieredCache`];
//! in-flight fetches for the same URL are collapsed behind a per-URL gate so
//! the origin sees one request.

use crate::archive::ArchivedResponse;
use crate::cache_key::fingerprint;
use crate::errors::Result;
use crate::message::{Request, Response};
use crate::store::TieredCache;
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// How the proxy caches responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheMode {
  /// never read or write the cache
  Off = 0,
  /// follow server cache-control
  Standard = 1,
  /// cache every GET unconditionally, other methods per server policy
  GetAggressive = 2,
  /// cache everything unconditionally
  Aggressive = 3,
}

impl TryFrom<u8> for CacheMode {
  type Error = crate::Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      0 => Ok(CacheMode::Off),
      1 => Ok(CacheMode::Standard),
      2 => Ok(CacheMode::GetAggressive),
      3 => Ok(CacheMode::Aggressive),
      other => Err(crate::Error::Config(format!("unknown cache mode {}", other))),
    }
  }
}

/// A stored cache entry: either an archived response or a failure reason,
/// never both, plus the moment it stops being valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  /// unix timestamp after which the entry is stale
  pub invalid_at: i64,
  /// archived response, absent for failure entries
  pub value: Option<ArchivedResponse>,
  /// failure reason, absent for success entries
  pub error: Option<String>,
}

/// Why a response was not cacheable, with the freshness lifetime when it was.
#[derive(Debug)]
pub struct Cacheability {
  /// reasons not to cache; empty means the server allows it
  pub no_cache_reasons: Vec<String>,
  /// explicit expiry; epoch when the server gave no freshness info
  pub expires: OffsetDateTime,
}

// Statuses a cache may store without explicit freshness information.
const UNDERSTOOD_STATUSES: &[u16] = &[200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

fn cache_control_directives(value: &str) -> Vec<(String, Option<String>)> {
  value
    .split(',')
    .map(|directive| {
      let directive = directive.trim();
      match directive.split_once('=') {
        Some((k, v)) => (
          k.to_ascii_lowercase(),
          Some(v.trim_matches('"').to_string()),
        ),
        None => (directive.to_ascii_lowercase(), None),
      }
    })
    .collect()
}

fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
  // IMF-fixdate: Sun, 06 Nov 1994 08:49:37 GMT
  let format = time::format_description::parse(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT",
  )
  .ok()?;
  time::PrimitiveDateTime::parse(value, &format)
    .ok()
    .map(|dt| dt.assume_utc())
}

/// Decide cacheability for a request/response pair.
///
/// A practical subset of RFC 9111: `no-store`/`no-cache`/`private` and
/// request `Authorization` forbid storage, `max-age`/`s-maxage` then
/// `Expires` supply freshness. Responses without freshness info are storable
/// but immediately stale, which matters only outside the aggressive modes.
pub fn evaluate_cacheability(request: &Request, response: &Response) -> Cacheability {
  let mut reasons = Vec::new();
  let now = OffsetDateTime::now_utc();
  let mut expires = OffsetDateTime::UNIX_EPOCH;

  if request.method() != Method::GET && request.method() != Method::HEAD {
    reasons.push("request method is not cacheable".to_string());
  }
  if request.headers().get(http::header::AUTHORIZATION).is_some() {
    reasons.push("request carries authorization".to_string());
  }
  if let Some(cc) = request
    .headers()
    .get(http::header::CACHE_CONTROL)
    .and_then(|v| v.to_str().ok())
  {
    for (directive, _) in cache_control_directives(cc) {
      if directive == "no-store" {
        reasons.push("request cache-control: no-store".to_string());
      }
    }
  }

  if !UNDERSTOOD_STATUSES.contains(&response.status_code().as_u16()) {
    reasons.push(format!(
      "status {} is not cacheable by default",
      response.status_code().as_u16()
    ));
  }
  let mut max_age: Option<i64> = None;
  if let Some(cc) = response
    .headers()
    .get(http::header::CACHE_CONTROL)
    .and_then(|v| v.to_str().ok())
  {
    for (directive, argument) in cache_control_directives(cc) {
      match directive.as_str() {
        "no-store" => reasons.push("response cache-control: no-store".to_string()),
        "no-cache" => reasons.push("response cache-control: no-cache".to_string()),
        "private" => reasons.push("response cache-control: private".to_string()),
        // shared-cache lifetime wins over max-age
        "s-maxage" => max_age = argument.and_then(|v| v.parse().ok()).or(max_age),
        "max-age" => {
          if max_age.is_none() {
            max_age = argument.and_then(|v| v.parse().ok());
          }
        }
        _ => {}
      }
    }
  }

  if let Some(seconds) = max_age {
    expires = now + time::Duration::seconds(seconds);
  } else if let Some(date) = response
    .headers()
    .get(http::header::EXPIRES)
    .and_then(|v| v.to_str().ok())
    .and_then(parse_http_date)
  {
    expires = date;
  }

  Cacheability {
    no_cache_reasons: reasons,
    expires,
  }
}

/// Single-flight gate keyed by URL.
///
/// Acquire parks the caller until no other fetch holds the URL; release drops
/// whatever permit is currently held for the URL, so it is idempotent and a
/// no-op without a prior acquire.
#[derive(Default)]
struct UrlGate {
  // guards gate creation only, never held while waiting
  gates: StdMutex<HashMap<String, Arc<Semaphore>>>,
  holders: StdMutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl UrlGate {
  async fn acquire(&self, url: &str) {
    let gate = {
      let mut gates = self.gates.lock().expect("url gate map poisoned");
      gates
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(Semaphore::new(1)))
        .clone()
    };
    let permit = gate
      .acquire_owned()
      .await
      .expect("url gate semaphore never closes");
    self
      .holders
      .lock()
      .expect("url holder map poisoned")
      .insert(url.to_string(), permit);
  }

  fn release(&self, url: &str) {
    self
      .holders
      .lock()
      .expect("url holder map poisoned")
      .remove(url);
  }
}

/// The cache middleware state.
pub struct CacheLayer {
  mode: AtomicU8,
  store: TieredCache,
  gate: UrlGate,
  fail_ttl: Duration,
}

impl CacheLayer {
  /// Default save interval for the disk index, in mutations.
  pub const SAVE_INTERVAL: usize = 10;
  /// Default lifetime of failure entries.
  pub const FAIL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

  /// Build the layer with its two-tier store under `cache_dir`.
  pub async fn new(cache_dir: impl AsRef<Path>, max_memory_mb: i64, max_disk_mb: i64) -> Self {
    Self {
      mode: AtomicU8::new(CacheMode::Standard as u8),
      store: TieredCache::new(cache_dir, max_memory_mb, max_disk_mb, Self::SAVE_INTERVAL).await,
      gate: UrlGate::default(),
      fail_ttl: Self::FAIL_TTL,
    }
  }

  /// Override the failure-entry lifetime.
  pub fn with_fail_ttl(mut self, ttl: Duration) -> Self {
    self.fail_ttl = ttl;
    self
  }

  /// The current mode.
  pub fn mode(&self) -> CacheMode {
    CacheMode::try_from(self.mode.load(Ordering::SeqCst)).unwrap_or(CacheMode::Standard)
  }

  /// Switch modes at runtime. In-flight requests keep the snapshot they
  /// started with.
  pub fn set_mode(&self, mode: CacheMode) {
    self.mode.store(mode as u8, Ordering::SeqCst);
  }

  fn is_aggressive_for(&self, mode: CacheMode, request: &Request) -> bool {
    match mode {
      CacheMode::Aggressive => true,
      CacheMode::GetAggressive => request.method() == Method::GET,
      _ => false,
    }
  }

  /// Look up a still-valid entry for the request.
  ///
  /// Under the aggressive modes existence is validity; otherwise the entry
  /// must not have expired.
  pub async fn get_contents(&self, mode: CacheMode, request: &Request) -> Option<CacheEntry> {
    if mode == CacheMode::Off {
      return None;
    }
    let key = fingerprint(request);
    if !self.store.has(&key).await {
      return None;
    }
    let raw = match self.store.get(&key).await {
      Ok(raw) => raw,
      Err(err) => {
        warn!("failed to read cache entry for {}: {}", request.url(), err);
        return None;
      }
    };
    let entry: CacheEntry = match serde_json::from_slice(&raw) {
      Ok(entry) => entry,
      Err(err) => {
        // treated as a miss; the entry will be overwritten
        warn!("failed to decode cache entry for {}: {}", request.url(), err);
        return None;
      }
    };
    let valid = self.is_aggressive_for(mode, request)
      || OffsetDateTime::now_utc().unix_timestamp() < entry.invalid_at;
    if valid {
      debug!("cache hit: {}", request.url());
      Some(entry)
    } else {
      debug!("cache expired: {}", request.url());
      None
    }
  }

  /// Store a response if the mode and server policy allow it.
  pub async fn set_valid(&self, mode: CacheMode, request: &Request, response: &Response) {
    if mode == CacheMode::Off {
      return;
    }
    let cacheability = evaluate_cacheability(request, response);
    if !self.is_aggressive_for(mode, request) && !cacheability.no_cache_reasons.is_empty() {
      debug!(
        "not caching {}: {:?}",
        request.url(),
        cacheability.no_cache_reasons
      );
      return;
    }
    debug!("caching response for {}", request.url());
    let entry = CacheEntry {
      invalid_at: cacheability.expires.unix_timestamp(),
      value: Some(ArchivedResponse::from(response)),
      error: None,
    };
    self.put(request, &entry).await;
  }

  /// Store a failure entry so identical requests fail fast. Aggressive modes
  /// only.
  pub async fn set_failed(&self, mode: CacheMode, request: &Request, error: &str) {
    if !self.is_aggressive_for(mode, request) {
      return;
    }
    let entry = CacheEntry {
      invalid_at: (OffsetDateTime::now_utc() + self.fail_ttl).unix_timestamp(),
      value: None,
      error: Some(error.to_string()),
    };
    self.put(request, &entry).await;
  }

  async fn put(&self, request: &Request, entry: &CacheEntry) {
    let encoded = match serde_json::to_vec(entry) {
      Ok(encoded) => encoded,
      Err(err) => {
        warn!("failed to encode cache entry for {}: {}", request.url(), err);
        return;
      }
    };
    if let Err(err) = self.store.set(&fingerprint(request), &encoded).await {
      warn!("failed to store cache entry for {}: {}", request.url(), err);
    }
  }

  /// Block until no other fetch for this URL is in flight. No-op when the
  /// mode snapshot is `Off`.
  pub async fn acquire_url_lock(&self, mode: CacheMode, url: &str) {
    if mode == CacheMode::Off {
      return;
    }
    self.gate.acquire(url).await;
  }

  /// Release the URL lock regardless of which caller holds it.
  ///
  /// Deliberately mode-independent: a mode switch mid-request must not strand
  /// the locks of requests already in flight.
  pub fn release_url_lock(&self, url: &str) {
    self.gate.release(url);
  }

  /// Empty both tiers and flush the index.
  pub async fn clear(&self) {
    self.store.clear().await;
  }

  /// Wait for any background index flush to settle.
  pub async fn join_flush(&self) {
    self.store.join_flush().await;
  }
}
