//! Control-plane API behavior, driven through the router directly.

use axum::body::Body;
use axum::http::{header, Request as HttpRequest, StatusCode};
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::sync::{Arc, RwLock};
use tower::ServiceExt;
use vinylproxy::control::{router, ControlState};
use vinylproxy::{CacheLayer, CacheMode, DialerSession, Recorder, RecorderMode};

async fn state() -> (ControlState, tempfile::TempDir) {
  let dir = tempfile::tempdir().unwrap();
  let state = ControlState {
    recorder: Arc::new(RwLock::new(Recorder::new())),
    cache: Arc::new(CacheLayer::new(dir.path().join("cache"), 16, 16).await),
    session: Arc::new(DialerSession::default()),
  };
  (state, dir)
}

fn post(path: &str, body: &str) -> HttpRequest<Body> {
  HttpRequest::builder()
    .method("POST")
    .uri(path)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
  axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap()
    .to_vec()
}

#[tokio::test]
async fn record_clears_and_switches_to_write() {
  let (state, _dir) = state().await;
  {
    let mut recorder = state.recorder.write().unwrap();
    let request = vinylproxy::Request::new(
      Method::GET,
      "http://old.example/".parse().unwrap(),
      HeaderMap::new(),
      Bytes::new(),
    );
    let response =
      vinylproxy::Response::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"x"));
    recorder.log_pair(&request, &response, "");
  }

  let response = router(state.clone())
    .oneshot(post("/api/tape/record", ""))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);

  let recorder = state.recorder.read().unwrap();
  assert_eq!(recorder.mode(), RecorderMode::Write);
  assert!(recorder.is_empty());
}

#[tokio::test]
async fn stop_keeps_records() {
  let (state, _dir) = state().await;
  state
    .recorder
    .write()
    .unwrap()
    .set_mode(RecorderMode::Write);

  let response = router(state.clone())
    .oneshot(post("/api/tape/stop", ""))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    state.recorder.read().unwrap().mode(),
    RecorderMode::Off
  );
}

#[tokio::test]
async fn retrieve_round_trips_through_load() {
  let (state, _dir) = state().await;
  {
    let mut recorder = state.recorder.write().unwrap();
    let request = vinylproxy::Request::new(
      Method::GET,
      "http://tape.example/".parse().unwrap(),
      HeaderMap::new(),
      Bytes::new(),
    );
    let response = vinylproxy::Response::new(
      StatusCode::OK,
      HeaderMap::new(),
      Bytes::from_static(b"payload"),
    );
    recorder.log_pair(&request, &response, "session-1");
  }

  // export with no body selects everything
  let response = router(state.clone())
    .oneshot(post("/api/tape/retrieve", ""))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers().get(header::CONTENT_TYPE).unwrap(),
    "application/x-gzip"
  );
  let exported = body_bytes(response).await;

  // load it back through the multipart endpoint
  let boundary = "vinyltestboundary";
  let mut multipart = Vec::new();
  multipart.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
  multipart.extend_from_slice(
    b"Content-Disposition: form-data; name=\"file\"; filename=\"tape.gz\"\r\n",
  );
  multipart.extend_from_slice(b"Content-Type: application/x-gzip\r\n\r\n");
  multipart.extend_from_slice(&exported);
  multipart.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

  let load_request = HttpRequest::builder()
    .method("POST")
    .uri("/api/tape/load")
    .header(
      header::CONTENT_TYPE,
      format!("multipart/form-data; boundary={}", boundary),
    )
    .body(Body::from(multipart))
    .unwrap();
  let response = router(state.clone())
    .oneshot(load_request)
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);

  let recorder = state.recorder.read().unwrap();
  assert_eq!(recorder.mode(), RecorderMode::Read);
  assert_eq!(recorder.len(), 1);
}

#[tokio::test]
async fn tape_clear_with_id_is_partial() {
  let (state, _dir) = state().await;
  {
    let mut recorder = state.recorder.write().unwrap();
    let request = |url: &str| {
      vinylproxy::Request::new(
        Method::GET,
        url.parse().unwrap(),
        HeaderMap::new(),
        Bytes::new(),
      )
    };
    let response =
      vinylproxy::Response::new(StatusCode::OK, HeaderMap::new(), Bytes::new());
    recorder.log_pair(&request("http://a.example/"), &response, "t1");
    recorder.log_pair(&request("http://b.example/"), &response, "t2");
  }

  let response = router(state.clone())
    .oneshot(post("/api/tape/clear", r#"{"tapeID":"t1"}"#))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(state.recorder.read().unwrap().len(), 1);

  let response = router(state.clone())
    .oneshot(post("/api/tape/clear", "{}"))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert!(state.recorder.read().unwrap().is_empty());
}

#[tokio::test]
async fn cache_mode_validates_input() {
  let (state, _dir) = state().await;

  let response = router(state.clone())
    .oneshot(post("/api/cache/mode", r#"{"mode":3}"#))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(state.cache.mode(), CacheMode::Aggressive);

  let response = router(state.clone())
    .oneshot(post("/api/cache/mode", r#"{"mode":9}"#))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  // the bad request left the mode untouched
  assert_eq!(state.cache.mode(), CacheMode::Aggressive);
}

#[tokio::test]
async fn dialer_load_rejects_bad_regex() {
  let (state, _dir) = state().await;
  let response = router(state.clone())
    .oneshot(post(
      "/api/dialer/load",
      r#"{"definitions":[{"priority":1,"requiresUrlRegex":"("}]}"#,
    ))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  let body = body_bytes(response).await;
  assert!(String::from_utf8_lossy(&body).contains("success"));
}

#[tokio::test]
async fn dialer_load_accepts_definitions() {
  let (state, _dir) = state().await;
  let response = router(state.clone())
    .oneshot(post(
      "/api/dialer/load",
      r#"{"definitions":[
        {"priority":1000,"requiresUrlRegex":".*\\.png","requiresResourceTypes":["image"]},
        {"priority":1,"proxyServer":"http://127.0.0.1:3128","proxyUsername":"u","proxyPassword":"p"}
      ]}"#,
    ))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);

  // empty list swaps back to the passthrough
  let response = router(state.clone())
    .oneshot(post("/api/dialer/load", r#"{"definitions":[]}"#))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
}
