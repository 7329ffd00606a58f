//! The MITM proxy data plane.
//!
//! Accepts forward-proxy traffic: `CONNECT` requests are answered with 200,
//! the client-side TLS session is terminated with a certificate minted for
//! the target host, and the decrypted requests run through the pipeline.
//! Plain HTTP requests (absolute-form or origin-form with a `Host` header)
//! take the same pipeline without the TLS step.

use crate::certs::{CertStore, CertificateAuthority};
use crate::errors::{Error, Result};
use crate::message::{Request, Response};
use crate::pipeline::Pipeline;
use crate::wire;
use http::Method;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// A stream with bytes already pulled off it re-attached in front.
///
/// Parsing the CONNECT head goes through a buffered reader that may already
/// hold the first TLS record; the handshake must see those bytes again.
struct PrefixedStream<S> {
  prefix: Vec<u8>,
  offset: usize,
  inner: S,
}

impl<S> PrefixedStream<S> {
  fn new(prefix: Vec<u8>, inner: S) -> Self {
    Self {
      prefix,
      offset: 0,
      inner,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if self.offset < self.prefix.len() {
      let remaining = &self.prefix[self.offset..];
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      self.offset += n;
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// The proxy listener.
pub struct ProxyServer {
  authority: Arc<CertificateAuthority>,
  cert_store: Arc<CertStore<Arc<ServerConfig>>>,
  pipeline: Arc<Pipeline>,
}

impl ProxyServer {
  /// Assemble the data plane.
  pub fn new(authority: Arc<CertificateAuthority>, pipeline: Arc<Pipeline>) -> Self {
    Self {
      authority,
      cert_store: Arc::new(CertStore::new()),
      pipeline,
    }
  }

  /// Bind and serve; runs until the task is dropped.
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::Config(format!("failed to bind proxy to {}: {}", addr, e)))?;
    self.serve(listener).await
  }

  /// Accept loop over an already-bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    info!(
      "proxy listening on {}",
      listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default()
    );
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let authority = self.authority.clone();
          let cert_store = self.cert_store.clone();
          let pipeline = self.pipeline.clone();
          tokio::spawn(async move {
            debug!("connection from {}", peer);
            if let Err(err) = handle_connection(stream, authority, cert_store, pipeline).await {
              debug!("connection from {} ended: {}", peer, err);
            }
          });
        }
        Err(err) => error!("failed to accept connection: {}", err),
      }
    }
  }
}

async fn handle_connection(
  stream: TcpStream,
  authority: Arc<CertificateAuthority>,
  cert_store: Arc<CertStore<Arc<ServerConfig>>>,
  pipeline: Arc<Pipeline>,
) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let request = match wire::read_request(&mut reader, "http", None).await? {
    Some(request) => request,
    None => return Ok(()),
  };

  if request.method() == Method::CONNECT {
    handle_connect(reader, request, authority, cert_store, pipeline).await
  } else {
    // plain HTTP: serve the first request, then keep the connection alive
    serve_request(reader.get_mut(), &pipeline, &request).await?;
    if wants_close(&request) {
      let _ = reader.get_mut().shutdown().await;
      return Ok(());
    }
    serve_loop(reader, "http", None, pipeline).await
  }
}

async fn handle_connect(
  reader: BufReader<TcpStream>,
  request: Request,
  authority: Arc<CertificateAuthority>,
  cert_store: Arc<CertStore<Arc<ServerConfig>>>,
  pipeline: Arc<Pipeline>,
) -> Result<()> {
  let target = request.uri().to_string();
  let (host, port) = target
    .rsplit_once(':')
    .map(|(host, port)| (host.to_string(), port.to_string()))
    .ok_or_else(|| Error::InvalidRequest(format!("bad CONNECT target {:?}", target)))?;

  // retain bytes the head parser already buffered before handing the stream
  // to the TLS acceptor
  let buffered = reader.buffer().to_vec();
  let mut stream = PrefixedStream::new(buffered, reader.into_inner());

  stream
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  stream.flush().await?;

  // tunnels to port 80 carry cleartext HTTP, there is nothing to terminate
  if port == "80" {
    let reader = BufReader::new(stream);
    return serve_loop(reader, "http", Some(target), pipeline).await;
  }

  let config = {
    let gen_host = host.clone();
    cert_store
      .fetch(&host, move || authority.server_config(&gen_host))
      .await?
  };
  let acceptor = TlsAcceptor::from(config);
  let tls_stream = acceptor
    .accept(stream)
    .await
    .map_err(|e| Error::Certificate(format!("client TLS handshake failed for {}: {}", host, e)))?;

  let reader = BufReader::new(tls_stream);
  serve_loop(reader, "https", Some(target), pipeline).await
}

async fn serve_loop<S>(
  mut reader: BufReader<S>,
  scheme: &str,
  default_authority: Option<String>,
  pipeline: Arc<Pipeline>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let request =
      match wire::read_request(&mut reader, scheme, default_authority.as_deref()).await? {
        Some(request) => request,
        None => {
          let _ = reader.get_mut().shutdown().await;
          return Ok(());
        }
      };
    let close = wants_close(&request);
    serve_request(reader.get_mut(), &pipeline, &request).await?;
    if close {
      // a graceful shutdown sends close_notify on TLS sessions
      let _ = reader.get_mut().shutdown().await;
      return Ok(());
    }
  }
}

async fn serve_request<W>(writer: &mut W, pipeline: &Pipeline, request: &Request) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let response = pipeline.handle(request.clone()).await;
  write_response(writer, &response, request.method()).await
}

async fn write_response<W>(
  writer: &mut W,
  response: &Response,
  request_method: &Method,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&response.to_raw(request_method)).await?;
  writer.flush().await?;
  Ok(())
}

fn wants_close(request: &Request) -> bool {
  request
    .headers()
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("close"))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn prefixed_stream_replays_buffer_first() {
    let (client, mut server) = tokio::io::duplex(64);
    tokio::spawn(async move {
      use tokio::io::AsyncWriteExt;
      server.write_all(b" world").await.unwrap();
    });
    let mut stream = PrefixedStream::new(b"hello".to_vec(), client);
    let mut out = vec![0u8; 11];
    stream.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"hello world");
  }
}
