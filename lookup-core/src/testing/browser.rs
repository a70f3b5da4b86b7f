use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::browser::{
    BrowserError, BrowserResult, BrowserSession, CaptureContext, DeviceProfile,
    InterceptedResponse, ResponseStream, SessionCookie, SessionLauncher, SessionMetrics,
};
use crate::capture::DeviceTarget;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Everything the scripted browser was asked to do.
#[derive(Debug, Clone, Default)]
pub struct BrowserJournal {
    pub launches: usize,
    pub contexts: Vec<DeviceTarget>,
    pub navigations: Vec<String>,
    pub screenshots: Vec<PathBuf>,
    /// Subset of `screenshots` taken full-page.
    pub full_page_screenshots: Vec<PathBuf>,
    pub cookies: Vec<SessionCookie>,
    pub closed_contexts: usize,
    pub shutdowns: usize,
}

#[derive(Debug, Clone)]
struct Script {
    timeout_on: Vec<String>,
    fail_on: Vec<String>,
    page_height: f64,
    growth: f64,
    responses: HashMap<String, Vec<InterceptedResponse>>,
    fail_launch: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            timeout_on: Vec::new(),
            fail_on: Vec::new(),
            page_height: 1_000.0,
            growth: 0.0,
            responses: HashMap::new(),
            fail_launch: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory browser. Screenshots are tiny PNG stubs written to disk; scripted
/// responses are replayed to interceptors when their page is visited.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBrowser {
    script: Arc<Script>,
    journal: Arc<Mutex<BrowserJournal>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::make_mut(&mut self.script)
    }

    /// Navigations to URLs containing `fragment` time out (after loading).
    pub fn timeout_on(mut self, fragment: &str) -> Self {
        self.script_mut().timeout_on.push(fragment.to_string());
        self
    }

    /// Navigations to URLs containing `fragment` fail outright.
    pub fn fail_on(mut self, fragment: &str) -> Self {
        self.script_mut().fail_on.push(fragment.to_string());
        self
    }

    pub fn with_page_height(mut self, height: f64) -> Self {
        self.script_mut().page_height = height;
        self
    }

    /// Every height measurement finds the page `step` pixels taller.
    pub fn with_growing_page(mut self, step: f64) -> Self {
        self.script_mut().growth = step;
        self
    }

    /// Replay `response` to interceptors once `page_url` is visited.
    pub fn respond_on(mut self, page_url: &str, response: InterceptedResponse) -> Self {
        self.script_mut()
            .responses
            .entry(page_url.to_string())
            .or_default()
            .push(response);
        self
    }

    pub fn fail_launch(mut self) -> Self {
        self.script_mut().fail_launch = true;
        self
    }

    pub fn session(&self) -> ScriptedSession {
        ScriptedSession {
            script: Arc::clone(&self.script),
            journal: Arc::clone(&self.journal),
        }
    }

    pub fn launcher(&self) -> ScriptedLauncher {
        ScriptedLauncher {
            browser: self.clone(),
        }
    }

    pub fn journal(&self) -> BrowserJournal {
        lock(&self.journal).clone()
    }
}

pub struct ScriptedLauncher {
    browser: ScriptedBrowser,
}

#[async_trait]
impl SessionLauncher for ScriptedLauncher {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserSession>> {
        lock(&self.browser.journal).launches += 1;
        if self.browser.script.fail_launch {
            return Err(BrowserError::Launch("scripted launch failure".into()));
        }
        Ok(Box::new(self.browser.session()))
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    journal: Arc<Mutex<BrowserJournal>>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn new_context(&self, device: &DeviceProfile) -> BrowserResult<Box<dyn CaptureContext>> {
        lock(&self.journal).contexts.push(device.target);
        Ok(Box::new(ScriptedContext {
            device: device.clone(),
            script: Arc::clone(&self.script),
            journal: Arc::clone(&self.journal),
            interceptors: Mutex::new(Vec::new()),
            height: Mutex::new(self.script.page_height),
        }))
    }

    fn metrics(&self) -> SessionMetrics {
        let journal = lock(&self.journal);
        SessionMetrics {
            contexts_opened: journal.contexts.len() as u64,
            navigations: journal.navigations.len() as u64,
            screenshots: journal.screenshots.len() as u64,
            ..SessionMetrics::default()
        }
    }

    async fn shutdown(self: Box<Self>) -> BrowserResult<()> {
        lock(&self.journal).shutdowns += 1;
        Ok(())
    }
}

type Interceptor = (Vec<String>, mpsc::UnboundedSender<InterceptedResponse>);

pub struct ScriptedContext {
    device: DeviceProfile,
    script: Arc<Script>,
    journal: Arc<Mutex<BrowserJournal>>,
    interceptors: Mutex<Vec<Interceptor>>,
    height: Mutex<f64>,
}

impl ScriptedContext {
    fn replay(&self, page_url: &str) {
        let Some(responses) = self.script.responses.get(page_url) else {
            return;
        };
        let interceptors = lock(&self.interceptors);
        for response in responses {
            for (fragments, tx) in interceptors.iter() {
                if fragments.iter().any(|fragment| response.url.contains(fragment.as_str())) {
                    let _ = tx.send(response.clone());
                }
            }
        }
    }
}

#[async_trait]
impl CaptureContext for ScriptedContext {
    fn device(&self) -> &DeviceProfile {
        &self.device
    }

    async fn add_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()> {
        lock(&self.journal).cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn intercept_responses(&self, url_fragments: &[String]) -> BrowserResult<ResponseStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.interceptors).push((url_fragments.to_vec(), tx));
        Ok(rx)
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> BrowserResult<()> {
        lock(&self.journal).navigations.push(url.to_string());
        if self.script.fail_on.iter().any(|fragment| url.contains(fragment.as_str())) {
            return Err(BrowserError::Network(format!("scripted failure for {url}")));
        }
        self.replay(url);
        if self.script.timeout_on.iter().any(|fragment| url.contains(fragment.as_str())) {
            return Err(BrowserError::Timeout(url.to_string()));
        }
        Ok(())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> BrowserResult<()> {
        tokio::fs::write(path, PNG_MAGIC).await?;
        let mut journal = lock(&self.journal);
        journal.screenshots.push(path.to_path_buf());
        if full_page {
            journal.full_page_screenshots.push(path.to_path_buf());
        }
        Ok(())
    }

    async fn scroll_height(&self) -> BrowserResult<f64> {
        let mut height = lock(&self.height);
        *height += self.script.growth;
        Ok(*height)
    }

    async fn viewport_height(&self) -> BrowserResult<f64> {
        Ok(f64::from(self.device.height))
    }

    async fn scroll_to(&self, _y: f64) -> BrowserResult<()> {
        Ok(())
    }

    async fn wait_for_dom_ready(&self) -> BrowserResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        lock(&self.journal).closed_contexts += 1;
        lock(&self.interceptors).clear();
        Ok(())
    }
}
