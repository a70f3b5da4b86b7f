//! Browser engine facade.
//!
//! The capture engine only talks to the browser through these traits. The
//! Chromium implementation lives in [`super::automation`]; tests use the
//! scripted doubles in [`crate::testing`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::BrowserResult;
use super::fingerprint::DeviceProfile;
use super::metrics::SessionMetrics;

/// A response body observed while a context was open.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

pub type ResponseStream = mpsc::UnboundedReceiver<InterceptedResponse>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, rename = "httpOnly", alias = "http_only")]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            secure: true,
            http_only: false,
        }
    }
}

/// Starts a browser session for one capture task.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserSession>>;
}

/// One running browser shared by every scraper of a task.
///
/// Scrapers only borrow it; whoever launched it calls [`BrowserSession::shutdown`].
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Open an isolated browsing context emulating `device`.
    async fn new_context(&self, device: &DeviceProfile) -> BrowserResult<Box<dyn CaptureContext>>;

    fn metrics(&self) -> SessionMetrics {
        SessionMetrics::default()
    }

    async fn shutdown(self: Box<Self>) -> BrowserResult<()>;
}

/// A single isolated context (own cookies, own fingerprint, one page).
#[async_trait]
pub trait CaptureContext: Send + Sync {
    fn device(&self) -> &DeviceProfile;

    async fn add_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()>;

    /// Stream the bodies of responses whose URL contains any of `url_fragments`.
    ///
    /// Observation only: requests are never paused or altered.
    async fn intercept_responses(&self, url_fragments: &[String]) -> BrowserResult<ResponseStream>;

    /// Navigate and wait for the load, failing with [`super::BrowserError::Timeout`]
    /// once `timeout` elapses.
    async fn navigate(&self, url: &str, timeout: Duration) -> BrowserResult<()>;

    async fn screenshot(&self, path: &Path, full_page: bool) -> BrowserResult<()>;

    async fn scroll_height(&self) -> BrowserResult<f64>;

    async fn viewport_height(&self) -> BrowserResult<f64>;

    async fn scroll_to(&self, y: f64) -> BrowserResult<()>;

    async fn wait_for_dom_ready(&self) -> BrowserResult<()>;

    async fn close(self: Box<Self>) -> BrowserResult<()>;
}
