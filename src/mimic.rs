//! Browser-mimicking TLS client.
//!
//! Origins increasingly fingerprint the ClientHello and serve bot pages to
//! anything that does not look like a browser. The egress handshake is
//! therefore shaped after a current Chrome: its cipher-suite preference
//! order, TLS 1.2/1.3 only, and `h2`/`http/1.1` ALPN. The negotiated ALPN
//! protocol doubles as the protocol probe result for the round-tripper.
//!
//! Upstream certificates are not verified: the proxy itself is the trust
//! boundary, and scraping targets routinely sit behind interception-hostile
//! middleboxes with broken chains.

use crate::errors::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// ALPN token for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN token for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}

fn chrome_provider() -> CryptoProvider {
  let mut provider = ring::default_provider();
  // Chrome's preference order among the suites this stack supports
  provider.cipher_suites = vec![
    ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  ];
  provider
}

/// TLS connector whose handshake resembles a current browser.
#[derive(Clone)]
pub struct BrowserTlsConnector {
  connector: TlsConnector,
}

impl BrowserTlsConnector {
  /// Build the connector. Fails only if the provider/version combination is
  /// rejected, which would be a build misconfiguration.
  pub fn new() -> Result<Self> {
    let provider = Arc::new(chrome_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
      .with_protocol_versions(tokio_rustls::rustls::ALL_VERSIONS)
      .map_err(|e| Error::Config(format!("tls client config: {}", e)))?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(Self {
      connector: TlsConnector::from(Arc::new(config)),
    })
  }

  /// Complete a handshake with `host` as the server name (no port).
  pub async fn handshake(&self, host: &str, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|e| Error::Other(format!("bad server name {}: {}", host, e)))?;
    Ok(self.connector.connect(server_name, stream).await?)
  }
}

/// The ALPN protocol negotiated on a finished client handshake.
pub fn negotiated_alpn(stream: &TlsStream<TcpStream>) -> Option<Vec<u8>> {
  stream.get_ref().1.alpn_protocol().map(|p| p.to_vec())
}
