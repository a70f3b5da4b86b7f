//! Scripted doubles for the browser, HTTP, model and sink seams. Nothing in
//! here touches a real browser or the network.

mod browser;
mod doubles;

use std::sync::Arc;

pub use browser::{BrowserJournal, ScriptedBrowser, ScriptedContext, ScriptedLauncher, ScriptedSession};
pub use doubles::{
    FixedFingerprints, MemoryCookieStore, RecordingSink, ScriptedModel, StaticFetcher,
};

use crate::config::LookupConfig;
use crate::net::HttpFetcher;
use crate::scraper::ScraperDeps;
use crate::sessions::CookieStore;
use crate::signals::CancellationFlag;

/// Default config with every politeness pause removed and a one second
/// signal deadline.
pub fn fast_config() -> LookupConfig {
    let mut config = LookupConfig::default();
    config.capture.bulk_delay_ms = 0;
    config.capture.close_jitter_ms = [0, 0];
    config.capture.signal_deadline_seconds = 1;
    config
}

/// Dependencies wired to the given doubles.
pub fn deps_with(
    config: LookupConfig,
    fetcher: Arc<dyn HttpFetcher>,
    cookies: Arc<dyn CookieStore>,
) -> (ScraperDeps, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let deps = ScraperDeps {
        config: Arc::new(config),
        fingerprints: Arc::new(FixedFingerprints),
        fetcher,
        cookies,
        moderation: None,
        sink: sink.clone(),
        cancel: CancellationFlag::new(),
    };
    (deps, sink)
}

/// [`fast_config`] with no canned HTTP pages and no saved sessions.
pub fn test_deps() -> (ScraperDeps, Arc<RecordingSink>) {
    deps_with(
        fast_config(),
        Arc::new(StaticFetcher::default()),
        Arc::new(MemoryCookieStore::default()),
    )
}
