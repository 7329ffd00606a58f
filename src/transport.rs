//! The custom round-tripper.
//!
//! Converts one outbound request into one response. For every request the
//! dialer session supplies candidate egress routes; for every target host
//! the effective protocol is discovered once (TCP dial, then a mimicking TLS
//! handshake whose ALPN decides HTTP/2 vs HTTP/1.1) and cached. Transports
//! are cached per (dialer, protocol) pair so retries against a different
//! route never reuse the wrong handshake flavor.

use crate::dialer::{DialerDefinition, DialerSession, RESOURCE_TYPE_HEADER};
use crate::errors::{Error, Result};
use crate::message::{Request, Response};
use crate::mimic::{negotiated_alpn, BrowserTlsConnector, ALPN_H2};
use crate::wire;
use bytes::Bytes;
use http::{Uri, Version};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Effective wire protocol for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
  /// cleartext HTTP/1.1
  Http1,
  /// HTTP/1.1 over TLS
  Http1Tls,
  /// HTTP/2 over TLS (ALPN `h2`)
  Http2Tls,
}

impl Protocol {
  fn is_tls(self) -> bool {
    matches!(self, Protocol::Http1Tls | Protocol::Http2Tls)
  }
}

/// Dial address for a URI: `host:port`, falling back to the scheme name as
/// the port token when the URL carries no explicit port.
pub fn dialer_address(uri: &Uri) -> String {
  let host = uri.host().unwrap_or_default();
  match uri.port_u16() {
    Some(port) => format!("{}:{}", host, port),
    None => format!("{}:{}", host, uri.scheme_str().unwrap_or("http")),
  }
}

fn address_host(addr: &str) -> &str {
  addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

struct Transport {
  protocol: Protocol,
  dialer: Arc<DialerDefinition>,
  tls: BrowserTlsConnector,
}

impl Transport {
  async fn round_trip(&self, request: &Request) -> Result<Response> {
    let addr = dialer_address(request.uri());
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.dialer.dial(&addr))
      .await
      .map_err(|_| Error::Other(format!("connect timeout for {}", addr)))??;

    let exchange = async {
      if self.protocol.is_tls() {
        let tls_stream = self.tls.handshake(address_host(&addr), stream).await?;
        match self.protocol {
          Protocol::Http2Tls => http2_exchange(tls_stream, request).await,
          _ => http1_exchange(tls_stream, request).await,
        }
      } else {
        http1_exchange(stream, request).await
      }
    };
    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
      .await
      .map_err(|_| Error::Other(format!("exchange timeout for {}", addr)))?
  }
}

async fn http1_exchange<S>(stream: S, request: &Request) -> Result<Response>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // one exchange per connection keeps close-delimited bodies unambiguous
  let mut request = request.clone();
  request.headers_mut().insert(
    http::header::CONNECTION,
    http::HeaderValue::from_static("close"),
  );
  let mut reader = BufReader::new(stream);
  reader.get_mut().write_all(&request.to_raw()).await?;
  reader.get_mut().flush().await?;
  wire::read_response(&mut reader, request.method()).await
}

async fn http2_exchange<S>(stream: S, request: &Request) -> Result<Response>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (client, connection) = h2::client::handshake(stream)
    .await
    .map_err(|e| Error::Other(format!("h2 handshake failed: {}", e)))?;
  tokio::spawn(async move {
    let _ = connection.await;
  });
  let mut client = client
    .ready()
    .await
    .map_err(|e| Error::Other(format!("h2 client not ready: {}", e)))?;

  let mut h2_request = http::Request::builder()
    .method(request.method())
    .uri(request.uri())
    .version(Version::HTTP_2);
  for (key, value) in request.headers().iter() {
    // connection-level headers must not appear on an h2 stream
    if key == http::header::CONNECTION
      || key == http::header::TRANSFER_ENCODING
      || key == http::header::UPGRADE
      || key == http::header::HOST
      || key.as_str() == "keep-alive"
      || key.as_str() == "proxy-connection"
    {
      continue;
    }
    h2_request = h2_request.header(key, value);
  }
  let body = request.body().clone();
  let h2_request = h2_request.body(())?;

  let (response_future, mut send_stream) = client
    .send_request(h2_request, body.is_empty())
    .map_err(|e| Error::Other(format!("failed to send h2 request: {}", e)))?;
  if !body.is_empty() {
    send_stream
      .send_data(body, true)
      .map_err(|e| Error::Other(format!("failed to send h2 body: {}", e)))?;
  }

  let h2_response = response_future
    .await
    .map_err(|e| Error::Other(format!("failed to receive h2 response: {}", e)))?;
  let status = h2_response.status();
  let headers = h2_response.headers().clone();
  let mut body_stream = h2_response.into_body();
  let mut body = Vec::new();
  while let Some(chunk) = body_stream.data().await {
    let chunk = chunk.map_err(|e| Error::Other(format!("failed to read h2 body: {}", e)))?;
    body.extend_from_slice(&chunk);
    body_stream
      .flow_control()
      .release_capacity(chunk.len())
      .map_err(|e| Error::Other(format!("failed to release h2 capacity: {}", e)))?;
  }

  Ok(Response::new(status, headers, Bytes::from(body)))
}

/// Round-tripper with per-host protocol memory and per-route transports.
pub struct RoundTripper {
  session: Arc<DialerSession>,
  tls: BrowserTlsConnector,
  // host -> discovered protocol
  protocols: RwLock<HashMap<String, Protocol>>,
  // (dialer identifier, protocol) -> transport
  transports: RwLock<HashMap<(String, Protocol), Arc<Transport>>>,
}

impl RoundTripper {
  /// Build over a dialer session.
  pub fn new(session: Arc<DialerSession>) -> Result<Self> {
    Ok(Self {
      session,
      tls: BrowserTlsConnector::new()?,
      protocols: RwLock::new(HashMap::new()),
      transports: RwLock::new(HashMap::new()),
    })
  }

  /// Execute the request against the best available egress route.
  ///
  /// Retries on dial, handshake and HTTP-level failures (any status outside
  /// [200, 400)) until the dialer budget is exhausted.
  pub async fn round_trip(&self, request: &Request) -> Result<Response> {
    let mut context = self.session.new_context(request);
    let mut request = request.clone();
    // control metadata stays inside the proxy
    request.headers_mut().remove(RESOURCE_TYPE_HEADER);

    debug!("requesting {}", request.url());
    loop {
      let dialer = match self.session.next_dialer(&mut context) {
        Some(dialer) => dialer,
        None => return Err(Error::ExhaustedDialers),
      };

      let protocol = match self.solve_protocol(&request, &dialer).await {
        Ok(protocol) => protocol,
        Err(err) => {
          warn!("failed to solve protocol for {}: {}", request.url(), err);
          continue;
        }
      };
      let transport = self.solve_transport(protocol, &dialer);

      match transport.round_trip(&request).await {
        Ok(response) => {
          let status = response.status_code().as_u16();
          if (200..400).contains(&status) {
            return Ok(response);
          }
          debug!("invalid response {} for {}", status, request.url());
        }
        Err(err) => {
          debug!("round trip failed for {}: {}", request.url(), err);
        }
      }
    }
  }

  /// Discover (or recall) the protocol for the request's host.
  async fn solve_protocol(
    &self,
    request: &Request,
    dialer: &Arc<DialerDefinition>,
  ) -> Result<Protocol> {
    let host_key = dialer_address(request.uri());
    {
      let protocols = self.protocols.read().expect("protocol map poisoned");
      if let Some(protocol) = protocols.get(&host_key) {
        debug!("cache hit: protocol for {}", host_key);
        return Ok(*protocol);
      }
    }

    let protocol = self.probe_protocol(request, dialer, &host_key).await?;
    self
      .protocols
      .write()
      .expect("protocol map poisoned")
      .insert(host_key, protocol);
    Ok(protocol)
  }

  async fn probe_protocol(
    &self,
    request: &Request,
    dialer: &Arc<DialerDefinition>,
    host_key: &str,
  ) -> Result<Protocol> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, dialer.dial(host_key))
      .await
      .map_err(|_| Error::Other(format!("connect timeout for {}", host_key)))??;

    // HTTP/2 is only spoken over TLS, plain http is settled without a probe
    if request.uri().scheme_str() == Some("http") {
      debug!("using HTTP/1.1 for {}", host_key);
      return Ok(Protocol::Http1);
    }

    let tls_stream = self.tls.handshake(address_host(host_key), stream).await?;
    let protocol = match negotiated_alpn(&tls_stream) {
      Some(alpn) if alpn == ALPN_H2 => Protocol::Http2Tls,
      _ => Protocol::Http1Tls,
    };
    debug!("using {:?} for {}", protocol, host_key);
    Ok(protocol)
  }

  /// Fetch or build the transport for a (dialer, protocol) pair.
  fn solve_transport(&self, protocol: Protocol, dialer: &Arc<DialerDefinition>) -> Arc<Transport> {
    let key = (dialer.identifier().to_string(), protocol);
    {
      let transports = self.transports.read().expect("transport map poisoned");
      if let Some(transport) = transports.get(&key) {
        debug!("cache hit: transport for {:?}", key);
        return transport.clone();
      }
    }
    let transport = Arc::new(Transport {
      protocol,
      dialer: dialer.clone(),
      tls: self.tls.clone(),
    });
    self
      .transports
      .write()
      .expect("transport map poisoned")
      .insert(key, transport.clone());
    transport
  }
}
