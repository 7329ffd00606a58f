//! Control-plane HTTP API.
//!
//! A small axum router the client bindings drive between test runs: switch
//! tape and cache modes, move tape data in and out, and replace the dialer
//! definitions. Mutations land on the same collaborators the data plane
//! uses; their own locks serialize access.

use crate::cache::{CacheLayer, CacheMode};
use crate::dialer::{DialerDefinition, DialerSession, RequestFilter, UpstreamProxy};
use crate::errors::{Error, Result};
use crate::recorder::{Recorder, RecorderMode};
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared handles the control plane mutates.
#[derive(Clone)]
pub struct ControlState {
  /// the tape
  pub recorder: Arc<RwLock<Recorder>>,
  /// the cache layer
  pub cache: Arc<CacheLayer>,
  /// the egress session
  pub session: Arc<DialerSession>,
}

#[derive(Debug, Deserialize, Default)]
struct TapeIdRequest {
  #[serde(rename = "tapeID", default)]
  tape_id: String,
}

#[derive(Debug, Deserialize)]
struct CacheModeRequest {
  mode: u8,
}

#[derive(Debug, Deserialize)]
struct DialerPayload {
  priority: i32,
  #[serde(rename = "proxyServer")]
  proxy_server: Option<String>,
  #[serde(rename = "proxyUsername")]
  proxy_username: Option<String>,
  #[serde(rename = "proxyPassword")]
  proxy_password: Option<String>,
  #[serde(rename = "requiresUrlRegex")]
  requires_url_regex: Option<String>,
  #[serde(rename = "requiresResourceTypes")]
  requires_resource_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct DialerLoadRequest {
  definitions: Vec<DialerPayload>,
}

fn success() -> Response {
  Json(json!({ "success": true })).into_response()
}

fn failure(status: StatusCode, error: &str) -> Response {
  (status, Json(json!({ "success": false, "error": error }))).into_response()
}

/// Build the control-plane router.
pub fn router(state: ControlState) -> Router {
  Router::new()
    .route("/api/tape/record", post(tape_record))
    .route("/api/tape/stop", post(tape_stop))
    .route("/api/tape/retrieve", post(tape_retrieve))
    .route("/api/tape/load", post(tape_load))
    .route("/api/tape/clear", post(tape_clear))
    .route("/api/cache/mode", post(cache_mode))
    .route("/api/cache/clear", post(cache_clear))
    .route("/api/dialer/load", post(dialer_load))
    // tapes for long sessions run well past the default body limit
    .layer(axum::extract::DefaultBodyLimit::max(256 * 1024 * 1024))
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
    .with_state(state)
}

/// Serve the router on `addr`.
pub async fn run(state: ControlState, addr: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| Error::Config(format!("failed to bind control plane to {}: {}", addr, e)))?;
  info!("control plane listening on {}", addr);
  axum::serve(listener, router(state))
    .await
    .map_err(|e| Error::Other(e.to_string()))
}

async fn tape_record(State(state): State<ControlState>) -> Response {
  let mut recorder = state.recorder.write().expect("recorder poisoned");
  recorder.set_mode(RecorderMode::Write);
  recorder.clear();
  info!("tape recording started");
  success()
}

async fn tape_stop(State(state): State<ControlState>) -> Response {
  // keep the records around so they can still be retrieved
  state
    .recorder
    .write()
    .expect("recorder poisoned")
    .set_mode(RecorderMode::Off);
  info!("tape recording stopped");
  success()
}

async fn tape_retrieve(State(state): State<ControlState>, body: axum::body::Bytes) -> Response {
  // clients may post an empty body for "everything"
  let request: TapeIdRequest = serde_json::from_slice(&body).unwrap_or_default();
  let exported = state
    .recorder
    .read()
    .expect("recorder poisoned")
    .export_data(&request.tape_id);
  match exported {
    Ok(data) => (
      StatusCode::OK,
      [(header::CONTENT_TYPE, "application/x-gzip")],
      data,
    )
      .into_response(),
    Err(err) => failure(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
  }
}

async fn tape_load(State(state): State<ControlState>, mut multipart: Multipart) -> Response {
  let mut payload: Option<Vec<u8>> = None;
  while let Ok(Some(field)) = multipart.next_field().await {
    if field.name() == Some("file") {
      match field.bytes().await {
        Ok(bytes) => payload = Some(bytes.to_vec()),
        Err(err) => return failure(StatusCode::BAD_REQUEST, &err.to_string()),
      }
    }
  }
  let Some(payload) = payload else {
    return failure(StatusCode::BAD_REQUEST, "missing file field");
  };

  let mut recorder = state.recorder.write().expect("recorder poisoned");
  recorder.set_mode(RecorderMode::Read);
  match recorder.load_data(&payload) {
    Ok(()) => success(),
    Err(err) => failure(StatusCode::BAD_REQUEST, &err.to_string()),
  }
}

async fn tape_clear(State(state): State<ControlState>, body: axum::body::Bytes) -> Response {
  let request: TapeIdRequest = serde_json::from_slice(&body).unwrap_or_default();
  let mut recorder = state.recorder.write().expect("recorder poisoned");
  if request.tape_id.is_empty() {
    recorder.clear();
  } else {
    recorder.clear_tape_id(&request.tape_id);
  }
  success()
}

async fn cache_mode(
  State(state): State<ControlState>,
  Json(request): Json<CacheModeRequest>,
) -> Response {
  let mode = match CacheMode::try_from(request.mode) {
    Ok(mode) => mode,
    Err(err) => return failure(StatusCode::BAD_REQUEST, &err.to_string()),
  };
  state.cache.set_mode(mode);
  info!("cache mode set: {:?}", mode);
  if mode == CacheMode::Off {
    state.cache.clear().await;
  }
  success()
}

async fn cache_clear(State(state): State<ControlState>) -> Response {
  state.cache.clear().await;
  info!("cache cleared");
  success()
}

fn build_definitions(payloads: Vec<DialerPayload>) -> Result<Vec<DialerDefinition>> {
  payloads
    .into_iter()
    .map(|payload| {
      let proxy = match payload.proxy_server.filter(|url| !url.is_empty()) {
        Some(url) => Some(UpstreamProxy::new(
          &url,
          payload.proxy_username,
          payload.proxy_password,
        )?),
        None => None,
      };
      let resource_types = payload.requires_resource_types.unwrap_or_default();
      let filter = if payload.requires_url_regex.is_some() || !resource_types.is_empty() {
        Some(RequestFilter::new(
          payload.requires_url_regex.as_deref(),
          resource_types,
        )?)
      } else {
        None
      };
      Ok(DialerDefinition::new(payload.priority, proxy, filter))
    })
    .collect()
}

async fn dialer_load(
  State(state): State<ControlState>,
  Json(request): Json<DialerLoadRequest>,
) -> Response {
  match build_definitions(request.definitions) {
    Ok(definitions) => {
      info!("installing {} dialer definitions", definitions.len().max(1));
      state.session.replace(definitions);
      success()
    }
    Err(err) => failure(StatusCode::BAD_REQUEST, &err.to_string()),
  }
}
