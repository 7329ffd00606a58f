//! vinylproxy binary: CLI parsing, startup and shutdown.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vinylproxy::certs::{install_ca, CertificateAuthority};
use vinylproxy::control::{self, ControlState};
use vinylproxy::dialer::{DialerDefinition, UpstreamProxy};
use vinylproxy::fetch::Fetcher;
use vinylproxy::{
  CacheLayer, DialerSession, Pipeline, ProxyServer, Recorder, RoundTripper, DEFAULT_CONTROL_PORT,
  DEFAULT_PORT,
};

#[derive(Parser)]
#[command(name = "vinylproxy", about = "Programmable MITM proxy with record/replay")]
struct Cli {
  #[command(subcommand)]
  command: Option<Command>,

  /// proxy listen port
  #[arg(long, default_value_t = DEFAULT_PORT)]
  port: u16,

  /// control API listen port
  #[arg(long = "control-port", default_value_t = DEFAULT_CONTROL_PORT)]
  control_port: u16,

  /// CA certificate path, defaults to <state-dir>/ca.crt
  #[arg(long = "ca-certificate")]
  ca_certificate: Option<PathBuf>,

  /// CA key path, defaults to <state-dir>/ca.key
  #[arg(long = "ca-key")]
  ca_key: Option<PathBuf>,

  /// memory cache tier bound in MB, -1 for unbounded
  #[arg(long = "cache-memory-mb", default_value_t = 20)]
  cache_memory_mb: i64,

  /// disk cache tier bound in MB, -1 for unbounded
  #[arg(long = "cache-disk-mb", default_value_t = 500)]
  cache_disk_mb: i64,

  /// upstream proxy installed as the default dialer
  #[arg(long = "proxy-server")]
  proxy_server: Option<String>,

  /// username for the upstream proxy
  #[arg(long = "proxy-username")]
  proxy_username: Option<String>,

  /// password for the upstream proxy
  #[arg(long = "proxy-password")]
  proxy_password: Option<String>,

  /// log every proxied request
  #[arg(short, long)]
  verbose: bool,
}

#[derive(Subcommand)]
enum Command {
  /// Generate the local CA (if missing) and install it into the OS trust
  /// stores.
  InstallCa,
}

fn state_dir() -> PathBuf {
  directories::UserDirs::new()
    .map(|dirs| dirs.home_dir().join(".vinylproxy"))
    .unwrap_or_else(|| PathBuf::from(".vinylproxy"))
}

#[tokio::main]
async fn main() -> vinylproxy::Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .init();

  tokio_rustls::rustls::crypto::ring::default_provider()
    .install_default()
    .expect("rustls provider installed once at startup");

  let state_dir = state_dir();
  let ca_certificate = cli
    .ca_certificate
    .unwrap_or_else(|| state_dir.join("ca.crt"));
  let ca_key = cli.ca_key.unwrap_or_else(|| state_dir.join("ca.key"));

  let authority =
    Arc::new(CertificateAuthority::load_or_generate(&ca_certificate, &ca_key).await?);

  if let Some(Command::InstallCa) = cli.command {
    install_ca(authority.ca_cert_path())?;
    info!("CA installed into the system trust stores");
    return Ok(());
  }

  let recorder = Arc::new(RwLock::new(Recorder::new()));
  let cache = Arc::new(
    CacheLayer::new(
      state_dir.join("cache"),
      cli.cache_memory_mb,
      cli.cache_disk_mb,
    )
    .await,
  );

  let session = match cli.proxy_server {
    Some(proxy_server) => {
      let upstream =
        UpstreamProxy::new(&proxy_server, cli.proxy_username, cli.proxy_password)?;
      Arc::new(DialerSession::new(
        vec![DialerDefinition::new(1, Some(upstream), None)],
        0,
      ))
    }
    None => Arc::new(DialerSession::default()),
  };

  let round_tripper = Arc::new(RoundTripper::new(session.clone())?);
  let pipeline = Arc::new(Pipeline::new(
    recorder.clone(),
    cache.clone(),
    Fetcher::new(round_tripper),
  ));

  let proxy = ProxyServer::new(authority, pipeline);
  let proxy_addr = format!("0.0.0.0:{}", cli.port);
  tokio::spawn(async move {
    if let Err(err) = proxy.run(&proxy_addr).await {
      error!("proxy exited: {}", err);
      std::process::exit(1);
    }
  });

  let control_state = ControlState {
    recorder,
    cache: cache.clone(),
    session,
  };
  let control_addr = format!("0.0.0.0:{}", cli.control_port);
  tokio::spawn(async move {
    if let Err(err) = control::run(control_state, &control_addr).await {
      error!("control plane exited: {}", err);
      std::process::exit(1);
    }
  });

  tokio::signal::ctrl_c().await?;
  info!("vinylproxy: shutting down");
  // let any in-flight index flush land before the process exits
  cache.join_flush().await;
  Ok(())
}
