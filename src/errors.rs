//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `vinylproxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while proxying a request.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// io Error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// certificate loading or minting failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// bad configuration received at startup or on the control plane
  #[error("config error: {0}")]
  Config(String),
  /// malformed inbound request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// every candidate dialer was tried and none produced a valid response
  #[error("exhausted dialers")]
  ExhaustedDialers,
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
