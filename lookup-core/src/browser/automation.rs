use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};
use super::fingerprint::DeviceProfile;
use super::metrics::{SessionCounters, SessionMetrics};
use super::session::{
    BrowserSession, CaptureContext, InterceptedResponse, ResponseStream, SessionCookie,
    SessionLauncher,
};

const DOM_READY_POLL: Duration = Duration::from_millis(100);
const DOM_READY_LIMIT: Duration = Duration::from_secs(10);

/// Launches headless Chromium through the DevTools protocol.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ChromiumSection>,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ChromiumSection {
        &self.config
    }

    fn build_chromium_config(&self) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder();
        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--mute-audio".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(accept) = &self.config.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        if self.config.disable_automation_controlled {
            args.push("--disable-blink-features=AutomationControlled".into());
            args.push("--disable-features=AutomationControlled".into());
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl SessionLauncher for BrowserLauncher {
    async fn launch(&self) -> BrowserResult<Box<dyn BrowserSession>> {
        let chromium_config = self.build_chromium_config()?;
        info!(
            headless = self.config.headless,
            executable = ?self.config.executable_path,
            "launching chromium"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(Box::new(BrowserAutomation {
            browser: Arc::new(browser),
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            counters: Arc::new(SessionCounters::default()),
            open_contexts: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

/// A running Chromium process. Every capture context is an incognito-style
/// browser context so cookies never leak between scrapers.
#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Arc<Browser>,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<ChromiumSection>,
    counters: Arc<SessionCounters>,
    open_contexts: Arc<Mutex<Vec<BrowserContextId>>>,
}

impl BrowserAutomation {
    async fn configure_page(&self, page: &Page, device: &DeviceProfile) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&device.user_agent)
            .await?;

        let mut params_builder = SetUserAgentOverrideParams::builder()
            .user_agent(device.user_agent.clone())
            .platform(device.platform.clone());
        if let Some(accept) = &self.config.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;

        page.execute(SetDeviceMetricsOverrideParams::new(
            device.width as i64,
            device.height as i64,
            device.device_scale_factor,
            device.mobile,
        ))
        .await?;
        page.execute(SetTouchEmulationEnabledParams::new(device.has_touch))
            .await?;

        page.evaluate_on_new_document(
            AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(device.navigator_script())
                .build()
                .map_err(BrowserError::Configuration)?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for BrowserAutomation {
    async fn new_context(&self, device: &DeviceProfile) -> BrowserResult<Box<dyn CaptureContext>> {
        let created = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await?;
        let context_id = created.result.browser_context_id.clone();
        self.open_contexts.lock().await.push(context_id.clone());

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        let page = self.browser.new_page(params).await?;
        self.configure_page(&page, device).await?;
        self.counters.record_context_open();
        debug!(
            target = ?device.target,
            width = device.width,
            height = device.height,
            "opened browser context"
        );

        Ok(Box::new(ChromiumContext {
            page,
            browser: Arc::clone(&self.browser),
            context_id,
            device: device.clone(),
            counters: Arc::clone(&self.counters),
            open_contexts: Arc::clone(&self.open_contexts),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    fn metrics(&self) -> SessionMetrics {
        self.counters.snapshot()
    }

    async fn shutdown(mut self: Box<Self>) -> BrowserResult<()> {
        let leftover: Vec<_> = self.open_contexts.lock().await.drain(..).collect();
        for context_id in leftover {
            if let Err(err) = self
                .browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
            {
                debug!(error = %err, "failed to dispose leftover browser context");
            }
        }

        info!(metrics = ?self.counters.snapshot(), "shutting down chromium");
        match Arc::get_mut(&mut self.browser) {
            Some(browser) => {
                if let Err(err) = browser.close().await {
                    warn!(error = %err, "failed to close browser gracefully");
                }
                if let Err(err) = browser.wait().await {
                    warn!(error = %err, "failed to reap chromium process");
                }
            }
            None => {
                warn!("capture contexts still alive at shutdown");
                if let Err(err) = self.browser.execute(CloseParams::default()).await {
                    warn!(error = %err, "failed to close browser gracefully");
                }
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("BrowserAutomation dropped without explicit shutdown");
            }
        }
    }
}

pub struct ChromiumContext {
    page: Page,
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    device: DeviceProfile,
    counters: Arc<SessionCounters>,
    open_contexts: Arc<Mutex<Vec<BrowserContextId>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ChromiumContext {
    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn evaluate_number(&self, script: &str) -> BrowserResult<f64> {
        self.page
            .evaluate(script)
            .await?
            .into_value::<f64>()
            .map_err(|err| BrowserError::Script(err.to_string()))
    }
}

fn cookie_param(cookie: &SessionCookie) -> BrowserResult<CookieParam> {
    CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only)
        .build()
        .map_err(BrowserError::Configuration)
}

#[async_trait]
impl CaptureContext for ChromiumContext {
    fn device(&self) -> &DeviceProfile {
        &self.device
    }

    async fn add_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(cookie_param)
            .collect::<BrowserResult<Vec<_>>>()?;
        self.page.set_cookies(params).await?;
        debug!(count = cookies.len(), "injected session cookies");
        Ok(())
    }

    async fn intercept_responses(&self, url_fragments: &[String]) -> BrowserResult<ResponseStream> {
        let mut received = self
            .page
            .event_listener::<EventResponseReceived>()
            .await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let fragments = url_fragments.to_vec();
        let page = self.page.clone();
        let counters = Arc::clone(&self.counters);

        let listener = tokio::spawn(async move {
            // request id -> (url, status) for matching responses whose body is not loaded yet
            let mut pending: HashMap<String, (String, u16)> = HashMap::new();
            loop {
                tokio::select! {
                    Some(event) = received.next() => {
                        let url = &event.response.url;
                        if fragments.iter().any(|fragment| url.contains(fragment.as_str())) {
                            pending.insert(
                                event.request_id.inner().clone(),
                                (url.clone(), event.response.status as u16),
                            );
                        }
                    }
                    Some(event) = finished.next() => {
                        let Some((url, status)) = pending.remove(event.request_id.inner()) else {
                            continue;
                        };
                        let reply = match page
                            .execute(GetResponseBodyParams::new(event.request_id.clone()))
                            .await
                        {
                            Ok(reply) => reply,
                            Err(err) => {
                                debug!(url = %url, error = %err, "response body unavailable");
                                continue;
                            }
                        };
                        let body = if reply.result.base64_encoded {
                            match base64::engine::general_purpose::STANDARD.decode(&reply.result.body) {
                                Ok(bytes) => bytes,
                                Err(err) => {
                                    debug!(url = %url, error = %err, "undecodable response body");
                                    continue;
                                }
                            }
                        } else {
                            reply.result.body.clone().into_bytes()
                        };
                        counters.record_intercepted();
                        if tx.send(InterceptedResponse { url, status, body }).is_err() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        });
        self.listeners.lock().await.push(listener);
        Ok(rx)
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        match tokio::time::timeout(timeout, self.page.goto(params)).await {
            Ok(Ok(_)) => {
                self.counters.record_navigation(false);
                Ok(())
            }
            Ok(Err(err)) => {
                self.counters.record_navigation(false);
                Err(err.into())
            }
            Err(_) => {
                self.counters.record_navigation(true);
                Err(BrowserError::Timeout(format!("navigation to {url}")))
            }
        }
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> BrowserResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().full_page(full_page).build())
            .await?;
        tokio::fs::write(path, bytes).await?;
        self.counters.record_screenshot();
        Ok(())
    }

    async fn scroll_height(&self) -> BrowserResult<f64> {
        self.evaluate_number(
            "Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight)",
        )
        .await
    }

    async fn viewport_height(&self) -> BrowserResult<f64> {
        self.evaluate_number("window.innerHeight").await
    }

    async fn scroll_to(&self, y: f64) -> BrowserResult<()> {
        self.page
            .evaluate(format!("window.scrollTo(0, {y})"))
            .await?;
        Ok(())
    }

    async fn wait_for_dom_ready(&self) -> BrowserResult<()> {
        let started = tokio::time::Instant::now();
        loop {
            let state = self
                .page
                .evaluate("document.readyState")
                .await?
                .into_value::<String>()
                .map_err(|err| BrowserError::Script(err.to_string()))?;
            if state == "interactive" || state == "complete" {
                return Ok(());
            }
            if started.elapsed() >= DOM_READY_LIMIT {
                return Err(BrowserError::Timeout("DOM content loaded".into()));
            }
            tokio::time::sleep(DOM_READY_POLL).await;
        }
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        let this = *self;
        if let Err(err) = this.page.close().await {
            debug!(error = %err, "page already closed");
        }
        this.open_contexts
            .lock()
            .await
            .retain(|id| id != &this.context_id);
        this.browser
            .execute(DisposeBrowserContextParams::new(this.context_id.clone()))
            .await?;
        Ok(())
    }
}
