//! Routes intercepted network responses to record extraction, persistence and
//! completion signals.

pub mod instagram;
pub mod twitter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::{CaptureContext, InterceptedResponse};
use crate::error::CaptureResult;
use crate::net::HttpFetcher;
use crate::progress::{ScraperProgress, KEY_API_DATA};
use crate::signals::{CaptureSignal, CompletionSignals};
use crate::store::{RecordMap, RecordStore};

/// Full profile payload -> persisted record, and -> client-facing summary.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRule {
    pub signal: Option<CaptureSignal>,
    pub record: fn(&Value) -> Option<Value>,
    pub project: fn(&Value) -> Option<Value>,
    /// File name the avatar is downloaded to, next to `api_data.json`.
    pub avatar_file: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub enum RuleAction {
    /// Keyed collection merged into `<name>.json`.
    Collection {
        name: &'static str,
        signal: CaptureSignal,
        extract: fn(&Value) -> Option<RecordMap>,
    },
    Profile(ProfileRule),
}

impl RuleAction {
    fn signal(&self) -> Option<CaptureSignal> {
        match self {
            RuleAction::Collection { signal, .. } => Some(*signal),
            RuleAction::Profile(rule) => rule.signal,
        }
    }
}

/// Matches responses whose URL contains both `prefix` and `operation`.
#[derive(Debug, Clone, Copy)]
pub struct InterceptRule {
    pub prefix: &'static str,
    pub operation: &'static str,
    pub action: RuleAction,
}

impl InterceptRule {
    pub fn matches(&self, url: &str) -> bool {
        url.contains(self.prefix) && url.contains(self.operation)
    }
}

/// Per-task router. Shared by every context the task opens.
pub struct InterceptRouter {
    rules: Vec<InterceptRule>,
    store: Arc<RecordStore>,
    signals: CompletionSignals,
    progress: ScraperProgress,
    fetcher: Arc<dyn HttpFetcher>,
    fetch_avatar: bool,
    avatar_fetched: AtomicBool,
    profile: Mutex<Option<Value>>,
}

impl InterceptRouter {
    pub fn new(
        rules: Vec<InterceptRule>,
        store: Arc<RecordStore>,
        signals: CompletionSignals,
        progress: ScraperProgress,
        fetcher: Arc<dyn HttpFetcher>,
        fetch_avatar: bool,
    ) -> Self {
        Self {
            rules,
            store,
            signals,
            progress,
            fetcher,
            fetch_avatar,
            avatar_fetched: AtomicBool::new(false),
            profile: Mutex::new(None),
        }
    }

    pub fn signals(&self) -> &CompletionSignals {
        &self.signals
    }

    /// Last profile record routed, kept whether or not the store persists it.
    pub fn profile_record(&self) -> Option<Value> {
        self.profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// URL fragments the browser needs to report bodies for.
    pub fn url_fragments(&self) -> Vec<String> {
        let mut fragments: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !fragments.iter().any(|fragment| fragment == rule.prefix) {
                fragments.push(rule.prefix.to_string());
            }
        }
        fragments
    }

    /// First rule matching `url`, in table order.
    pub fn rule_for(&self, url: &str) -> Option<&InterceptRule> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    /// Start routing every response `context` observes. The returned task ends
    /// when the context closes.
    pub async fn install(self: &Arc<Self>, context: &dyn CaptureContext) -> CaptureResult<JoinHandle<()>> {
        let mut responses = context.intercept_responses(&self.url_fragments()).await?;
        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                router.route(response).await;
            }
            debug!("response stream closed");
        }))
    }

    /// Handle one response. Returns the signal raised by it, if any.
    pub async fn route(&self, response: InterceptedResponse) -> Option<CaptureSignal> {
        let rule = *self.rule_for(&response.url)?;
        let body: Value = match serde_json::from_slice(&response.body) {
            Ok(body) => body,
            Err(err) => {
                warn!(url = %response.url, status = response.status, error = %err, "intercepted body is not JSON");
                return None;
            }
        };

        match rule.action {
            RuleAction::Collection { name, extract, .. } => match extract(&body) {
                Some(records) => {
                    info!(collection = name, count = records.len(), "captured records");
                    if let Err(err) = self.store.merge(name, records).await {
                        warn!(collection = name, error = %err, "failed to persist records");
                    }
                }
                None => warn!(collection = name, url = %response.url, "unexpected payload shape"),
            },
            RuleAction::Profile(profile) => self.handle_profile(&profile, &body).await,
        }

        let signal = rule.action.signal()?;
        if self.signals.fire(signal) {
            debug!(signal = %signal, "completion signal raised");
        }
        Some(signal)
    }

    async fn handle_profile(&self, rule: &ProfileRule, body: &Value) {
        let Some(record) = (rule.record)(body) else {
            warn!("profile payload has an unexpected shape");
            return;
        };
        *self
            .profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record.clone());
        if let Err(err) = self.store.write("api_data", &record).await {
            warn!(error = %err, "failed to persist profile record");
        }

        let Some(mut projection) = (rule.project)(body) else {
            warn!("profile payload could not be summarised");
            return;
        };
        if let Some(file) = rule.avatar_file {
            if let Some(path) = self.fetch_avatar_once(&projection, file).await {
                projection["image_path"] = Value::String(path);
            }
        }
        self.progress.send(KEY_API_DATA, projection);
    }

    async fn fetch_avatar_once(&self, projection: &Value, file: &str) -> Option<String> {
        if !self.fetch_avatar {
            return None;
        }
        let url = projection.get("image_url").and_then(Value::as_str)?;
        if url.is_empty() || self.avatar_fetched.swap(true, Ordering::SeqCst) {
            return None;
        }
        let dest = self.store.dir().join(file);
        match self.fetcher.download(url, &dest).await {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                warn!(url, error = %err, "avatar download failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::scraper::Platform;
    use crate::testing::{RecordingSink, StaticFetcher};
    use serde_json::json;
    use tempfile::tempdir;

    fn response(url: &str, body: Value) -> InterceptedResponse {
        InterceptedResponse {
            url: url.to_string(),
            status: 200,
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn followers_page(names: &[&str]) -> Value {
        let entries: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "entryId": format!("user-{name}"),
                    "content": {"itemContent": {"user_results": {"result": {"legacy": {"screen_name": name}}}}}
                })
            })
            .collect();
        json!({"data": {"user": {"result": {"timeline": {"timeline": {"instructions": [
            {"type": "TimelineAddEntries", "entries": entries}
        ]}}}}}})
    }

    fn router(
        rules: Vec<InterceptRule>,
        store: RecordStore,
        sink: Arc<RecordingSink>,
        fetcher: Arc<StaticFetcher>,
    ) -> InterceptRouter {
        InterceptRouter::new(
            rules,
            Arc::new(store),
            CompletionSignals::new(),
            ScraperProgress::new(Platform::Twitter, sink),
            fetcher,
            true,
        )
    }

    #[tokio::test]
    async fn followers_pages_accumulate_and_raise_signal() {
        let dir = tempdir().unwrap();
        let router = router(
            twitter::rules(),
            RecordStore::new(dir.path()),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticFetcher::default()),
        );
        let url = "https://x.com/i/api/graphql/abc/Followers?variables=1";

        assert_eq!(
            router.route(response(url, followers_page(&["alice", "bob"]))).await,
            Some(CaptureSignal::Followers)
        );
        router.route(response(url, followers_page(&["carol"]))).await;

        assert!(router.signals().is_set(CaptureSignal::Followers));
        assert!(!router.signals().is_set(CaptureSignal::Following));
        let saved: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("followers.json")).unwrap())
                .unwrap();
        assert_eq!(saved.as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let dir = tempdir().unwrap();
        let router = router(
            twitter::rules(),
            RecordStore::new(dir.path()),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticFetcher::default()),
        );
        // Both operation names appear; the table lists Followers first.
        let rule = router
            .rule_for("https://x.com/i/api/graphql/q/Followers?features=Following")
            .unwrap();
        assert_eq!(rule.operation, "Followers");
        assert!(router.rule_for("https://x.com/home").is_none());
        assert!(router.rule_for("https://api.x.com/graphql/Followers").is_none());
    }

    #[tokio::test]
    async fn non_json_body_is_skipped_without_signal() {
        let dir = tempdir().unwrap();
        let router = router(
            twitter::rules(),
            RecordStore::new(dir.path()),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticFetcher::default()),
        );
        let bad = InterceptedResponse {
            url: "https://x.com/i/api/graphql/x/UserTweets".into(),
            status: 200,
            body: b"<html>rate limited</html>".to_vec(),
        };
        assert_eq!(router.route(bad).await, None);
        assert!(!router.signals().is_set(CaptureSignal::Tweets));
    }

    #[tokio::test]
    async fn unexpected_shape_still_raises_signal() {
        let dir = tempdir().unwrap();
        let router = router(
            twitter::rules(),
            RecordStore::new(dir.path()),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticFetcher::default()),
        );
        let url = "https://x.com/i/api/graphql/x/UserTweets";
        router.route(response(url, json!({"errors": [{"message": "x"}]}))).await;
        assert!(router.signals().is_set(CaptureSignal::Tweets));
        assert!(!dir.path().join("tweets.json").exists());
    }

    #[tokio::test]
    async fn instagram_profile_downloads_avatar_once() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let fetcher = Arc::new(StaticFetcher::default().with_bytes("https://cdn.example/p.jpg", b"jpg"));
        let router = router(
            instagram::rules(),
            RecordStore::new(dir.path()),
            sink.clone(),
            fetcher.clone(),
        );
        let body = json!({"data": {"user": {
            "full_name": "Someone",
            "biography": "",
            "profile_pic_url": "https://cdn.example/p.jpg",
            "follower_count": 1,
            "following_count": 2,
            "is_private": true
        }}});
        let url = "https://www.instagram.com/graphql/query?doc_id=1";
        router.route(response(url, body.clone())).await;
        router.route(response(url, body)).await;

        assert_eq!(fetcher.downloads().len(), 1);
        assert!(dir.path().join("profile_image.png").exists());
        assert!(dir.path().join("api_data.json").exists());

        let api_events: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Service(event) if event.data.key == KEY_API_DATA => Some(event.data.data),
                _ => None,
            })
            .collect();
        assert_eq!(api_events.len(), 2);
        assert!(api_events[0].get("image_path").is_some());
        assert!(api_events[1].get("image_path").is_none());
    }

    #[tokio::test]
    async fn screenshot_only_mode_keeps_signals_but_writes_nothing() {
        let dir = tempdir().unwrap();
        let router = router(
            twitter::rules(),
            RecordStore::disabled(dir.path().join("profile")),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticFetcher::default()),
        );
        let url = "https://x.com/i/api/graphql/x/Following";
        router.route(response(url, followers_page(&["dave"]))).await;
        assert!(router.signals().is_set(CaptureSignal::Following));
        assert!(router.profile_record().is_none());

        let profile = json!({"data": {"user": {"result": {"legacy": {
            "name": "jack",
            "description": "friends with @alice"
        }}}}});
        router
            .route(response("https://x.com/i/api/graphql/x/UserByScreenName", profile))
            .await;
        let record = router.profile_record().unwrap();
        assert_eq!(
            record.pointer("/data/user/result/legacy/description").unwrap(),
            "friends with @alice"
        );
        assert!(!dir.path().join("profile").exists());
    }
}
