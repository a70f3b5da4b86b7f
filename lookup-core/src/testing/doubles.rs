use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::browser::{DeviceProfile, FingerprintGenerator, SessionCookie};
use crate::capture::DeviceTarget;
use crate::error::{CaptureError, CaptureResult};
use crate::moderation::{LanguageModel, ModerationError};
use crate::net::{HttpFetcher, HttpRequest, HttpResponse};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sessions::CookieStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic profiles: 1366x768 desktop, 360x800 mobile.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedFingerprints;

impl FingerprintGenerator for FixedFingerprints {
    fn generate(&self, target: DeviceTarget) -> DeviceProfile {
        match target {
            DeviceTarget::Desktop => DeviceProfile {
                target,
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) TestAgent".into(),
                platform: "Linux x86_64".into(),
                width: 1366,
                height: 768,
                device_scale_factor: 1.0,
                mobile: false,
                has_touch: false,
            },
            DeviceTarget::Mobile => DeviceProfile {
                target,
                user_agent: "Mozilla/5.0 (Linux; Android 14) TestAgent Mobile".into(),
                platform: "Linux armv8l".into(),
                width: 360,
                height: 800,
                device_scale_factor: 3.0,
                mobile: true,
                has_touch: true,
            },
        }
    }
}

/// Keeps every emitted event in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        lock(&self.events).push(event);
    }
}

/// Canned HTTP answers keyed by exact URL. Unknown pages answer 404.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    pages: HashMap<String, HttpResponse>,
    files: HashMap<String, Vec<u8>>,
    redirects: HashMap<String, String>,
    requests: Mutex<Vec<HttpRequest>>,
    downloads: Mutex<Vec<(String, PathBuf)>>,
}

impl StaticFetcher {
    pub fn with_text(self, url: &str, body: &str) -> Self {
        self.with_status(url, 200, body)
    }

    pub fn with_status(mut self, url: &str, status: u16, body: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            HttpResponse {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    pub fn with_bytes(mut self, url: &str, bytes: &[u8]) -> Self {
        self.files.insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn with_redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn downloads(&self) -> Vec<(String, PathBuf)> {
        lock(&self.downloads).clone()
    }
}

#[async_trait]
impl HttpFetcher for StaticFetcher {
    async fn get_text(&self, request: HttpRequest) -> CaptureResult<HttpResponse> {
        let response = self.pages.get(&request.url).cloned().unwrap_or(HttpResponse {
            status: 404,
            body: String::new(),
        });
        lock(&self.requests).push(request);
        Ok(response)
    }

    async fn download(&self, url: &str, dest: &Path) -> CaptureResult<PathBuf> {
        let bytes = self
            .files
            .get(url)
            .ok_or_else(|| CaptureError::NotAvailable(url.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CaptureError::file_write(parent, err))?;
        }
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|err| CaptureError::file_write(dest, err))?;
        lock(&self.downloads).push((url.to_string(), dest.to_path_buf()));
        Ok(dest.to_path_buf())
    }

    async fn resolve_redirects(&self, url: &str) -> CaptureResult<String> {
        self.redirects
            .get(url)
            .cloned()
            .ok_or_else(|| CaptureError::NotAvailable(url.to_string()))
    }
}

/// Replays queued replies, then fails with [`ModerationError::EmptyCompletion`].
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModerationError>>>,
    repeat: Option<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModerationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answers every call with `reply`.
    pub fn repeating(reply: String) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::default()
        }
    }

    /// `(system, user)` prompt pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModerationError> {
        lock(&self.calls).push((system.to_string(), user.to_string()));
        if let Some(reply) = &self.repeat {
            return Ok(reply.clone());
        }
        lock(&self.replies)
            .pop_front()
            .unwrap_or(Err(ModerationError::EmptyCompletion))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCookieStore {
    pub twitter: Option<Vec<SessionCookie>>,
    pub instagram: Option<Vec<SessionCookie>>,
}

impl MemoryCookieStore {
    pub fn with_twitter(mut self, cookies: Vec<SessionCookie>) -> Self {
        self.twitter = Some(cookies);
        self
    }

    pub fn with_instagram(mut self, cookies: Vec<SessionCookie>) -> Self {
        self.instagram = Some(cookies);
        self
    }
}

#[async_trait]
impl CookieStore for MemoryCookieStore {
    async fn twitter_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>> {
        Ok(self.twitter.clone())
    }

    async fn instagram_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>> {
        Ok(self.instagram.clone())
    }
}
