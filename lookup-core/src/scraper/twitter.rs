use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ensure_dir, profile_dir, CaptureOptions, Platform, Scraper, ScraperDeps};
use crate::browser::{BrowserSession, CaptureContext, SessionCookie};
use crate::capture::{
    capture_bulk_page, capture_page, BulkCapture, CaptureTarget, CapturedArtifact, DeviceTarget,
};
use crate::error::{CaptureError, CaptureResult};
use crate::intercept::{self, InterceptRouter};
use crate::moderation::items_from_tweets;
use crate::net::HttpRequest;
use crate::parsers::mentions_to_follow;
use crate::progress::{ScraperProgress, TaskEvent};
use crate::signals::{CaptureSignal, CompletionSignals};
use crate::store::RecordStore;

const BASE_URL: &str = "https://x.com";

/// Steps of one Twitter capture session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ContextReady,
    ProfileCaptured,
    TweetsCaptured,
    FollowersCaptured,
    FollowingCaptured,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::ContextReady => "context_ready",
            SessionState::ProfileCaptured => "profile_captured",
            SessionState::TweetsCaptured => "tweets_captured",
            SessionState::FollowersCaptured => "followers_captured",
            SessionState::FollowingCaptured => "following_captured",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform pause before the context goes away.
fn close_jitter(bounds: [u64; 2]) -> Duration {
    let (low, high) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
    if high == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Everything a running session needs besides the context itself.
struct Session<'a> {
    context: &'a dyn CaptureContext,
    router: &'a Arc<InterceptRouter>,
    cookies: &'a [SessionCookie],
    dir: &'a Path,
    artifacts: Vec<CapturedArtifact>,
}

pub struct TwitterScraper {
    identity: String,
    deps: ScraperDeps,
    progress: ScraperProgress,
    tweets_path: Mutex<Option<PathBuf>>,
}

impl TwitterScraper {
    pub fn new(identity: String, deps: ScraperDeps) -> Self {
        let progress = deps.progress(Platform::Twitter);
        Self {
            identity,
            deps,
            progress,
            tweets_path: Mutex::new(None),
        }
    }

    fn profile_url(&self) -> String {
        format!("{BASE_URL}/{}", self.identity)
    }

    async fn wait_for(&self, router: &InterceptRouter, signal: CaptureSignal) -> CaptureResult<()> {
        let deadline = self.deps.config.capture.signal_deadline();
        router
            .signals()
            .wait(signal, deadline, &self.deps.cancel)
            .await
    }

    /// Navigate, tolerating a slow load.
    async fn visit(&self, context: &dyn CaptureContext, url: &str, timeout: Duration) -> CaptureResult<()> {
        match context.navigate(url, timeout).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_timeout() => {
                warn!(url, "navigation timed out; waiting for intercepted data anyway");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run one transition. Returns the state reached.
    async fn advance(&self, state: SessionState, session: &mut Session<'_>) -> CaptureResult<SessionState> {
        let capture = &self.deps.config.capture;
        match state {
            SessionState::Init => {
                session.context.add_cookies(session.cookies).await?;
                Ok(SessionState::ContextReady)
            }
            SessionState::ContextReady => {
                let url = self.profile_url();
                self.visit(session.context, &url, capture.profile_navigation_timeout())
                    .await?;
                self.wait_for(session.router, CaptureSignal::Profile).await?;
                let path = session.dir.join("profile.png");
                session.context.screenshot(&path, capture.full_page).await?;
                let device = session.context.device().target;
                session
                    .artifacts
                    .push(CapturedArtifact::new(path, &url, Some(device), None));
                self.send_images(&session.artifacts);
                Ok(SessionState::ProfileCaptured)
            }
            SessionState::ProfileCaptured => {
                self.wait_for(session.router, CaptureSignal::Tweets).await?;
                let url = self.profile_url();
                self.bulk(session, &url, "tweets", "Capturing tweets").await?;
                Ok(SessionState::TweetsCaptured)
            }
            SessionState::TweetsCaptured => {
                self.follow_list(session, "followers", CaptureSignal::Followers)
                    .await?;
                Ok(SessionState::FollowersCaptured)
            }
            SessionState::FollowersCaptured => {
                self.follow_list(session, "following", CaptureSignal::Following)
                    .await?;
                Ok(SessionState::FollowingCaptured)
            }
            SessionState::FollowingCaptured | SessionState::Closed => Ok(SessionState::Closed),
        }
    }

    async fn follow_list(
        &self,
        session: &mut Session<'_>,
        list: &str,
        signal: CaptureSignal,
    ) -> CaptureResult<()> {
        let url = format!("{}/{list}", self.profile_url());
        self.visit(session.context, &url, self.deps.config.capture.navigation_timeout())
            .await?;
        self.wait_for(session.router, signal).await?;
        self.bulk(session, &url, list, &format!("Capturing {list}"))
            .await
    }

    async fn bulk(
        &self,
        session: &mut Session<'_>,
        url: &str,
        folder: &str,
        message: &str,
    ) -> CaptureResult<()> {
        let capture = &self.deps.config.capture;
        let dest = session.dir.join(folder);
        let shots = capture_bulk_page(
            session.context,
            &self.progress,
            capture.bulk_delay(),
            BulkCapture {
                source_url: url,
                dest_dir: &dest,
                max_screenshots: capture.bulk_max_screenshots,
                message,
            },
        )
        .await?;
        info!(identity = %self.identity, folder, screenshots = shots.len(), "bulk capture finished");
        session.artifacts.extend(shots);
        self.send_images(&session.artifacts);
        Ok(())
    }

    fn send_images(&self, artifacts: &[CapturedArtifact]) {
        let paths: Vec<_> = artifacts.iter().map(|artifact| &artifact.path).collect();
        self.progress.images(&paths);
    }

    async fn run_session(
        &self,
        context: &dyn CaptureContext,
        router: &Arc<InterceptRouter>,
        cookies: &[SessionCookie],
        dir: &Path,
    ) -> (SessionState, CaptureResult<Vec<CapturedArtifact>>) {
        let listener = match router.install(context).await {
            Ok(listener) => listener,
            Err(err) => return (SessionState::Init, Err(err)),
        };
        let mut session = Session {
            context,
            router,
            cookies,
            dir,
            artifacts: Vec::new(),
        };
        let mut state = SessionState::Init;
        let outcome = loop {
            if let Err(err) = self.deps.cancel.checkpoint() {
                break Err(err);
            }
            match self.advance(state, &mut session).await {
                Ok(SessionState::Closed) => break Ok(()),
                Ok(next) => {
                    debug!(identity = %self.identity, from = %state, to = %next, "twitter session advanced");
                    state = next;
                }
                Err(err) => break Err(err),
            }
        };
        drop(listener);
        (state, outcome.map(|()| session.artifacts))
    }

    async fn capture_mentions(
        &self,
        router: &InterceptRouter,
        dir: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        let record = router.profile_record().unwrap_or(Value::Null);
        let description = record
            .pointer("/data/user/result/legacy/description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let targets: Vec<CaptureTarget> =
            mentions_to_follow(Platform::Twitter, &self.identity, description)
                .into_iter()
                .map(|handle| {
                    CaptureTarget::new(
                        format!("{BASE_URL}/{handle}"),
                        dir.join(&handle).join("capture.png"),
                    )
                })
                .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        self.deps.cancel.checkpoint()?;
        capture_page(
            session,
            self.deps.fingerprints.as_ref(),
            &self.deps.capture_settings(options),
            &targets,
            None,
            None,
        )
        .await
    }
}

#[async_trait]
impl Scraper for TwitterScraper {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value> {
        let cookies = self
            .deps
            .cookies
            .twitter_cookies()
            .await?
            .ok_or_else(|| CaptureError::AuthRequired("twitter session cookies".into()))?;
        let api = &self.deps.config.api;
        let (Some(endpoint), Some(bearer)) = (&api.twitter_user_endpoint, &api.twitter_bearer_token)
        else {
            return Err(CaptureError::NotAvailable(
                "twitter user lookup endpoint is not configured".into(),
            ));
        };
        let csrf = cookies
            .iter()
            .find(|cookie| cookie.name == "ct0")
            .map(|cookie| cookie.value.clone())
            .ok_or_else(|| CaptureError::AuthRequired("twitter ct0 cookie".into()))?;

        let variables = json!({ "screen_name": identity, "withSafetyModeUserFields": true });
        let request = HttpRequest::get(endpoint.clone())
            .query("variables", variables.to_string())
            .header("authorization", format!("Bearer {bearer}"))
            .header("x-csrf-token", csrf)
            .cookies(&cookies);
        let response = self.deps.fetcher.get_text(request).await?;
        match response.status {
            401 | 403 => {
                return Err(CaptureError::AuthRequired(format!(
                    "twitter answered {}",
                    response.status
                )))
            }
            status if !(200..300).contains(&status) => {
                return Err(CaptureError::NotAvailable(format!("twitter answered {status}")))
            }
            _ => {}
        }
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|err| CaptureError::MalformedRemotePayload(err.to_string()))?;
        body.pointer("/data/user/result")
            .filter(|user| user.is_object())
            .cloned()
            .ok_or_else(|| CaptureError::NotAvailable(format!("twitter user {identity}")))
    }

    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        let cookies = self
            .deps
            .cookies
            .twitter_cookies()
            .await?
            .ok_or_else(|| CaptureError::MissingCredentials("twitter session cookies".into()))?;
        info!(identity = %self.identity, cookies = cookies.len(), "capturing twitter profile");

        let dir = profile_dir(output_root, Platform::Twitter, &self.identity);
        ensure_dir(&dir).await?;
        let store = Arc::new(if options.store_api_responses {
            RecordStore::new(&dir)
        } else {
            RecordStore::disabled(&dir)
        });
        if let Ok(mut tweets_path) = self.tweets_path.lock() {
            *tweets_path = Some(store.path("tweets"));
        }
        let router = Arc::new(InterceptRouter::new(
            intercept::twitter::rules(),
            Arc::clone(&store),
            CompletionSignals::new(),
            self.progress.clone(),
            Arc::clone(&self.deps.fetcher),
            false,
        ));

        self.deps.cancel.checkpoint()?;
        let device = self.deps.fingerprints.generate(DeviceTarget::Mobile);
        let context = session.new_context(&device).await?;
        let (reached, outcome) = self
            .run_session(context.as_ref(), &router, &cookies, &dir)
            .await;

        if !self.deps.cancel.is_cancelled() {
            tokio::time::sleep(close_jitter(self.deps.config.capture.close_jitter_ms)).await;
        }
        if let Err(err) = context.close().await {
            warn!(identity = %self.identity, error = %err, "failed to close twitter context");
        }
        info!(identity = %self.identity, reached = %reached, state = %SessionState::Closed, "twitter session closed");

        let mut artifacts = outcome?;
        if options.in_depth {
            artifacts.extend(self.capture_mentions(&router, &dir, session, options).await?);
        }
        Ok(artifacts)
    }

    async fn post_task(&self) -> CaptureResult<()> {
        let Some(pipeline) = self.deps.moderation.as_ref() else {
            return Ok(());
        };
        let tweets_path = self
            .tweets_path
            .lock()
            .ok()
            .and_then(|path| path.clone());
        let Some(tweets_path) = tweets_path else {
            return Ok(());
        };
        let content = match tokio::fs::read_to_string(&tweets_path).await {
            Ok(content) => content,
            Err(_) => {
                debug!(path = %tweets_path.display(), "no tweets captured; skipping report");
                return Ok(());
            }
        };
        let tweets = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(tweets)) => tweets,
            Ok(_) => return Err(CaptureError::MalformedRemotePayload("tweets.json is not an object".into())),
            Err(err) => return Err(CaptureError::MalformedRemotePayload(err.to_string())),
        };

        let sink = &self.deps.sink;
        sink.emit(TaskEvent::GlobalMessage {
            data: "Starting Twitter Report".into(),
        }
        .into());
        let items = items_from_tweets(&tweets);
        info!(identity = %self.identity, tweets = items.len(), "running twitter report");
        let report = pipeline.report(&items).await;
        sink.emit(TaskEvent::TwitterReport {
            data: serde_json::to_value(&report)?,
        }
        .into());
        sink.emit(TaskEvent::GlobalMessage {
            data: String::new(),
        }
        .into());
        Ok(())
    }
}
