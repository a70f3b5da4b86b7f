use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ensure_dir, profile_dir, CaptureOptions, Platform, Scraper, ScraperDeps};
use crate::browser::{BrowserSession, CaptureContext, SessionCookie};
use crate::capture::{capture_page, CaptureTarget, CapturedArtifact, PageHook};
use crate::error::{CaptureError, CaptureResult};
use crate::intercept::{self, InterceptRouter};
use crate::net::HttpRequest;
use crate::parsers::mentions_to_follow;
use crate::progress::ScraperProgress;
use crate::signals::{CaptureSignal, CompletionSignals};
use crate::store::RecordStore;

const PROFILE_BASE: &str = "https://www.instagram.com";

/// Injects the saved session and, on the first context only, starts routing
/// GraphQL responses.
struct SessionHook {
    cookies: Vec<SessionCookie>,
    router: Option<Arc<InterceptRouter>>,
    router_installed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHook {
    fn new(cookies: Vec<SessionCookie>, router: Option<Arc<InterceptRouter>>) -> Self {
        Self {
            cookies,
            router,
            router_installed: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Let the router drain what its closed context delivered, then stop it.
    async fn stop_listener(&self, grace: Duration) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "instagram response router failed"),
            Err(_) => {
                handle.abort();
                debug!("instagram response router aborted");
            }
        }
    }
}

#[async_trait]
impl PageHook for SessionHook {
    async fn before_navigate(&self, context: &dyn CaptureContext) -> CaptureResult<()> {
        context.add_cookies(&self.cookies).await?;
        if let Some(router) = &self.router {
            if !self.router_installed.swap(true, Ordering::SeqCst) {
                let handle = router.install(context).await?;
                *self
                    .listener
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
                debug!("instagram response router installed");
            }
        }
        Ok(())
    }
}

pub struct InstagramScraper {
    identity: String,
    deps: ScraperDeps,
    progress: ScraperProgress,
}

impl InstagramScraper {
    pub fn new(identity: String, deps: ScraperDeps) -> Self {
        let progress = deps.progress(Platform::Instagram);
        Self {
            identity,
            deps,
            progress,
        }
    }

    async fn saved_cookies(&self) -> Vec<SessionCookie> {
        match self.deps.cookies.instagram_cookies().await {
            Ok(Some(cookies)) => cookies,
            Ok(None) => {
                warn!(identity = %self.identity, "no saved instagram session; capturing logged out");
                Vec::new()
            }
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "saved instagram session unreadable");
                Vec::new()
            }
        }
    }

    /// Give the router until the signal deadline to see the profile payload.
    /// Only cancellation is an error; a missing profile leaves nothing to follow.
    async fn wait_for_profile(&self, router: &InterceptRouter) -> CaptureResult<()> {
        let deadline = self.deps.config.capture.signal_deadline();
        match router
            .signals()
            .wait(CaptureSignal::Profile, deadline, &self.deps.cancel)
            .await
        {
            Err(CaptureError::Cancelled) => Err(CaptureError::Cancelled),
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "no profile payload; skipping mentions");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn mentioned_targets(&self, router: &InterceptRouter, dir: &Path) -> Vec<CaptureTarget> {
        let record = router.profile_record().unwrap_or(Value::Null);
        let biography = record
            .get("biography")
            .and_then(Value::as_str)
            .unwrap_or_default();
        mentions_to_follow(Platform::Instagram, &self.identity, biography)
            .into_iter()
            .map(|handle| {
                CaptureTarget::new(
                    format!("{PROFILE_BASE}/{handle}"),
                    dir.join(&handle).join("capture.png"),
                )
            })
            .collect()
    }
}

#[async_trait]
impl Scraper for InstagramScraper {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value> {
        let cookies = self
            .deps
            .cookies
            .instagram_cookies()
            .await?
            .ok_or_else(|| CaptureError::AuthRequired("instagram session cookies".into()))?;
        let api = &self.deps.config.api;
        let mut request = HttpRequest::get(api.instagram_profile_endpoint.clone())
            .query("username", identity)
            .cookies(&cookies);
        if let Some(app_id) = &api.instagram_app_id {
            request = request.header("X-IG-App-ID", app_id.clone());
        }
        let response = self.deps.fetcher.get_text(request).await?;
        match response.status {
            401 | 403 => {
                return Err(CaptureError::AuthRequired(format!(
                    "instagram answered {}",
                    response.status
                )))
            }
            status if !(200..300).contains(&status) => {
                return Err(CaptureError::NotAvailable(format!("instagram answered {status}")))
            }
            _ => {}
        }
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|err| CaptureError::MalformedRemotePayload(err.to_string()))?;
        body.pointer("/data/user")
            .filter(|user| user.is_object())
            .cloned()
            .ok_or_else(|| CaptureError::NotAvailable(format!("instagram user {identity}")))
    }

    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        info!(identity = %self.identity, "capturing instagram profile");
        let dir = profile_dir(output_root, Platform::Instagram, &self.identity);
        ensure_dir(&dir).await?;

        let store = Arc::new(if options.store_api_responses {
            RecordStore::new(&dir)
        } else {
            RecordStore::disabled(&dir)
        });
        let router = Arc::new(InterceptRouter::new(
            intercept::instagram::rules(),
            Arc::clone(&store),
            CompletionSignals::new(),
            self.progress.clone(),
            Arc::clone(&self.deps.fetcher),
            self.deps.config.capture.store_profile_images,
        ));
        let hook = SessionHook::new(self.saved_cookies().await, Some(Arc::clone(&router)));

        self.deps.cancel.checkpoint()?;
        self.progress.message("Capturing screenshots.");
        let settings = self.deps.capture_settings(options);
        let targets = vec![CaptureTarget::new(
            format!("{PROFILE_BASE}/{}", self.identity),
            dir.join("capture.png"),
        )];
        let captured = capture_page(
            session,
            self.deps.fingerprints.as_ref(),
            &settings,
            &targets,
            None,
            Some(&hook),
        )
        .await;
        self.progress.message("");
        let profile_wait = if options.in_depth && captured.is_ok() {
            self.wait_for_profile(&router).await
        } else {
            Ok(())
        };
        hook.stop_listener(self.deps.config.capture.signal_deadline())
            .await;
        let mut artifacts = captured?;
        profile_wait?;

        if options.in_depth {
            let mentioned = self.mentioned_targets(&router, &dir);
            if !mentioned.is_empty() {
                self.deps.cancel.checkpoint()?;
                let plain = SessionHook::new(hook.cookies.clone(), None);
                artifacts.extend(
                    capture_page(
                        session,
                        self.deps.fingerprints.as_ref(),
                        &settings,
                        &mentioned,
                        None,
                        Some(&plain),
                    )
                    .await?,
                );
            }
        }

        let paths: Vec<_> = artifacts.iter().map(|artifact| &artifact.path).collect();
        self.progress.images(&paths);
        Ok(artifacts)
    }
}
