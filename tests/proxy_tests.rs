//! Data-plane tests: the real listener, CONNECT interception included.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use vinylproxy::fetch::Fetcher;
use vinylproxy::{
  CacheLayer, CertificateAuthority, DialerSession, Pipeline, ProxyServer, Recorder, RecorderMode,
  Request, Response, RoundTripper,
};

struct Harness {
  proxy_addr: SocketAddr,
  recorder: Arc<RwLock<Recorder>>,
  ca_cert_path: std::path::PathBuf,
  _state_dir: tempfile::TempDir,
}

async fn spawn_proxy() -> Harness {
  // the provider may already be installed by a sibling test
  let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

  let state_dir = tempfile::tempdir().unwrap();
  let ca_cert_path = state_dir.path().join("ca.crt");
  let authority = Arc::new(
    CertificateAuthority::load_or_generate(&ca_cert_path, &state_dir.path().join("ca.key"))
      .await
      .unwrap(),
  );

  let recorder = Arc::new(RwLock::new(Recorder::new()));
  let cache = Arc::new(CacheLayer::new(state_dir.path().join("cache"), 16, 16).await);
  let session = Arc::new(DialerSession::default());
  let round_tripper = Arc::new(RoundTripper::new(session).unwrap());
  let pipeline = Arc::new(Pipeline::new(
    recorder.clone(),
    cache,
    Fetcher::new(round_tripper),
  ));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let proxy_addr = listener.local_addr().unwrap();
  let proxy = ProxyServer::new(authority, pipeline);
  tokio::spawn(async move {
    let _ = proxy.serve(listener).await;
  });

  Harness {
    proxy_addr,
    recorder,
    ca_cert_path,
    _state_dir: state_dir,
  }
}

async fn spawn_origin(body: &'static str) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        let mut buffer = vec![0u8; 8192];
        let n = stream.read(&mut buffer).await.unwrap_or(0);
        if n == 0 {
          return;
        }
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
          body.len(),
          body
        );
        let _ = stream.write_all(response.as_bytes()).await;
      });
    }
  });
  addr
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_http_request_is_proxied() {
  let harness = spawn_proxy().await;
  let origin = spawn_origin("proxied body").await;

  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{}/page HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin, origin
  );
  stream.write_all(request.as_bytes()).await.unwrap();

  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  let text = String::from_utf8_lossy(&raw);
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(text.ends_with("proxied body"));
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_intercepted_and_served_from_tape() {
  let harness = spawn_proxy().await;

  // preload the tape and flip to replay: no upstream dial should happen for
  // a host that does not exist
  {
    let request = Request::new(
      Method::GET,
      "https://tape.invalid/".parse().unwrap(),
      HeaderMap::new(),
      Bytes::new(),
    );
    let response = Response::new(
      StatusCode::OK,
      HeaderMap::new(),
      Bytes::from_static(b"straight off the tape"),
    );
    let mut recorder = harness.recorder.write().unwrap();
    recorder.log_pair(&request, &response, "");
    recorder.set_mode(RecorderMode::Read);
  }

  // CONNECT through the proxy
  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  stream
    .write_all(b"CONNECT tape.invalid:443 HTTP/1.1\r\nHost: tape.invalid:443\r\n\r\n")
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let mut status_line = String::new();
  tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut status_line)
    .await
    .unwrap();
  assert!(status_line.contains("200"));
  let mut blank = String::new();
  tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut blank)
    .await
    .unwrap();

  // trust the proxy's CA and complete the intercepted handshake
  let ca_pem = std::fs::read(&harness.ca_cert_path).unwrap();
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let server_name = ServerName::try_from("tape.invalid").unwrap();
  let mut tls = connector
    .connect(server_name, reader.into_inner())
    .await
    .unwrap();

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: tape.invalid\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut raw = Vec::new();
  tls.read_to_end(&mut raw).await.unwrap();
  let text = String::from_utf8_lossy(&raw);
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(text.ends_with("straight off the tape"));
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_serves_multiple_requests() {
  let harness = spawn_proxy().await;
  let origin = spawn_origin("again").await;

  let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
  for round in 0..2 {
    let request = format!(
      "GET http://{}/r{} HTTP/1.1\r\nHost: {}\r\n\r\n",
      origin, round, origin
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    // response is content-length framed, read the exact payload
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
      stream.read_exact(&mut byte).await.unwrap();
      header.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&header);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    let mut body = vec![0u8; 5];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"again");
  }
}
