use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserError;
use crate::signals::CaptureSignal;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Failures a scraper can hit while capturing one profile.
///
/// None of these escape the task runner: they are turned into progress events
/// and a per-scraper outcome.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("navigation to {url} timed out")]
    NavigationTimeout { url: String },
    #[error("malformed remote payload: {0}")]
    MalformedRemotePayload(String),
    #[error("failed to write {path}: {source}")]
    FileWrite { source: io::Error, path: PathBuf },
    #[error("missing credentials for {0}")]
    MissingCredentials(String),
    #[error("no browser session available: {0}")]
    NoSessionAvailable(String),
    #[error("timed out after {waited:?} waiting for the {signal} payload")]
    CaptureTimeout {
        signal: CaptureSignal,
        waited: Duration,
    },
    #[error("capture cancelled")]
    Cancelled,
    #[error("profile data not available: {0}")]
    NotAvailable(String),
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("invalid identity `{0}`")]
    InvalidIdentity(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CaptureError {
    pub fn file_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CaptureError::FileWrite {
            source,
            path: path.into(),
        }
    }

    /// Short machine-readable tag used in progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::NavigationTimeout { .. } => "navigation_timeout",
            CaptureError::MalformedRemotePayload(_) => "malformed_remote_payload",
            CaptureError::FileWrite { .. } => "file_write_failure",
            CaptureError::MissingCredentials(_) => "missing_credentials",
            CaptureError::NoSessionAvailable(_) => "no_session_available",
            CaptureError::CaptureTimeout { .. } => "capture_timeout",
            CaptureError::Cancelled => "cancelled",
            CaptureError::NotAvailable(_) => "not_available",
            CaptureError::AuthRequired(_) => "auth_required",
            CaptureError::InvalidIdentity(_) => "invalid_identity",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::Browser(_) => "browser",
            CaptureError::Http(_) => "http",
            CaptureError::Serde(_) => "serialization",
        }
    }
}
