//! Certificate authority and the per-host certificate store.
//!
//! The proxy terminates TLS for every intercepted host with a leaf
//! certificate minted on demand and chained to the locally trusted CA. Leaf
//! generation is not cheap, so the store coalesces it: N concurrent
//! first-time requests for one host trigger exactly one mint and the rest
//! wait for the result.

use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

/// Leaf certificate validity in seconds (1 year).
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before to absorb clock skew.
const NOT_BEFORE_OFFSET: i64 = 60;

/// The signing CA loaded from (or generated at) the configured paths.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from `cert_path`/`key_path`, generating and persisting a
  /// fresh one when either file is missing.
  pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
    if let Some(parent) = cert_path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let (issuer, ca_cert_der) =
      if fs::try_exists(cert_path).await? && fs::try_exists(key_path).await? {
        Self::load(cert_path, key_path).await?
      } else {
        info!("no CA material at {}, generating", cert_path.display());
        Self::generate(cert_path, key_path).await?
      };
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_path: cert_path.to_path_buf(),
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::Certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("failed to build issuer from CA cert: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::Certificate("no certificate found in CA PEM".to_string()))?
      .map_err(|e| Error::Certificate(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "vinylproxy CA");
    dn.push(DnType::OrganizationName, "vinylproxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::Certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::Certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    fs::write(cert_path, cert_pem.as_bytes()).await?;
    fs::write(key_path, key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::Certificate(format!("failed to build issuer: {}", e)))?;
    Ok((issuer, cert_der))
  }

  /// Mint a leaf for `host`, returning the chain `[leaf, ca]` and key.
  pub fn mint(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP literals get an IP SAN; everything else a DNS SAN
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::Certificate(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::Certificate(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::Certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::Certificate("failed to serialize leaf key".to_string()))?;
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// Build the TLS server config presented to clients connecting to `host`.
  pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let (chain, key) = self.mint(host)?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::Certificate(format!("failed to build server config: {}", e)))?;
    Ok(Arc::new(config))
  }

  /// Where the CA certificate lives on disk.
  pub fn ca_cert_path(&self) -> &Path {
    &self.ca_cert_path
  }
}

/// Per-host certificate cache with coalesced generation.
///
/// The top-level mutex only guards creation of the per-host mutex; the
/// per-host mutex is held across generation so concurrent first-time
/// requests for one host produce a single mint. Lock order is fixed:
/// store mutex, then host mutex, then the cert map lock.
pub struct CertStore<T: Clone> {
  certs: RwLock<HashMap<String, T>>,
  locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Clone> Default for CertStore<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone> CertStore<T> {
  /// An empty store.
  pub fn new() -> Self {
    Self {
      certs: RwLock::new(HashMap::new()),
      locks: std::sync::Mutex::new(HashMap::new()),
    }
  }

  fn host_lock(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().expect("cert lock map poisoned");
    locks
      .entry(host.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  /// Return the certificate for `host`, invoking `generate` on first use.
  ///
  /// A generation failure propagates to the caller and leaves the cache
  /// untouched, so the next request retries.
  pub async fn fetch<F>(&self, host: &str, generate: F) -> Result<T>
  where
    F: FnOnce() -> Result<T>,
  {
    let host_lock = self.host_lock(host);
    let _guard = host_lock.lock().await;

    {
      let certs = self.certs.read().expect("cert map poisoned");
      if let Some(cert) = certs.get(host) {
        debug!("certificate cache hit: {}", host);
        return Ok(cert.clone());
      }
    }

    debug!("certificate cache miss: {}", host);
    let cert = generate()?;
    self
      .certs
      .write()
      .expect("cert map poisoned")
      .insert(host.to_string(), cert.clone());
    Ok(cert)
  }
}

/// Install the CA certificate into the OS trust stores.
///
/// Linux installs into the system bundle and the NSS database Chromium
/// reads; macOS uses the system keychain.
pub fn install_ca(ca_cert_path: &Path) -> Result<()> {
  let ca_path = ca_cert_path.display().to_string();
  if cfg!(target_os = "linux") {
    let system_path = "/usr/local/share/ca-certificates/vinylproxy-ca.crt";
    run_command(Command::new("sudo").args(["cp", ca_path.as_str(), system_path]))?;
    run_command(Command::new("sudo").arg("update-ca-certificates"))?;

    // Chromium on Linux ignores the system store and reads ~/.pki/nssdb
    if let Some(user_dirs) = directories::UserDirs::new() {
      let nssdb = format!("sql:{}/.pki/nssdb", user_dirs.home_dir().display());
      run_command(Command::new("certutil").args([
        "-d",
        nssdb.as_str(),
        "-A",
        "-t",
        "C,,",
        "-n",
        "vinylproxy",
        "-i",
        system_path,
      ]))?;
    }
    Ok(())
  } else if cfg!(target_os = "macos") {
    run_command(Command::new("sudo").args([
      "security",
      "add-trusted-cert",
      "-d",
      "-p",
      "ssl",
      "-p",
      "basic",
      "-k",
      "/Library/Keychains/System.keychain",
      ca_path.as_str(),
    ]))
  } else {
    Err(Error::Config(
      "unknown OS, cannot install the CA automatically".to_string(),
    ))
  }
}

fn run_command(command: &mut Command) -> Result<()> {
  let status = command.status()?;
  if !status.success() {
    return Err(Error::Config(format!(
      "command {:?} exited with {}",
      command.get_program(),
      status
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn fetch_generates_once_per_host() {
    let store: Arc<CertStore<u64>> = Arc::new(CertStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let store = store.clone();
      let calls = calls.clone();
      tasks.push(tokio::spawn(async move {
        store
          .fetch("example.com", || {
            calls.fetch_add(1, Ordering::SeqCst);
            // widen the race window for stragglers
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(42)
          })
          .await
          .unwrap()
      }));
    }
    for task in tasks {
      assert_eq!(task.await.unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn hosts_do_not_share_certificates() {
    let store: CertStore<&'static str> = CertStore::new();
    let a = store.fetch("a.example", || Ok("cert-a")).await.unwrap();
    let b = store.fetch("b.example", || Ok("cert-b")).await.unwrap();
    assert_eq!(a, "cert-a");
    assert_eq!(b, "cert-b");
  }

  #[tokio::test]
  async fn generation_failure_does_not_poison() {
    let store: CertStore<u64> = CertStore::new();
    let failed = store
      .fetch("example.com", || {
        Err(Error::Certificate("boom".to_string()))
      })
      .await;
    assert!(failed.is_err());
    // next request retries and succeeds
    let cert = store.fetch("example.com", || Ok(7)).await.unwrap();
    assert_eq!(cert, 7);
  }

  #[tokio::test]
  async fn mint_produces_chain_for_host_and_ip() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(
      &dir.path().join("ca.crt"),
      &dir.path().join("ca.key"),
    )
    .await
    .unwrap();
    let (chain, _key) = ca.mint("example.com").unwrap();
    assert_eq!(chain.len(), 2);
    let (chain, _key) = ca.mint("127.0.0.1").unwrap();
    assert_eq!(chain.len(), 2);
  }

  #[tokio::test]
  async fn ca_reloads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.crt");
    let key_path = dir.path().join("ca.key");
    {
      CertificateAuthority::load_or_generate(&cert_path, &key_path)
        .await
        .unwrap();
    }
    let before = std::fs::read(&cert_path).unwrap();
    let ca = CertificateAuthority::load_or_generate(&cert_path, &key_path)
      .await
      .unwrap();
    let after = std::fs::read(&cert_path).unwrap();
    // loading must not regenerate the material
    assert_eq!(before, after);
    assert!(ca.mint("example.com").is_ok());
  }
}
