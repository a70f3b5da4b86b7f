pub mod browser;
pub mod capture;
pub mod config;
pub mod error;
pub mod intercept;
pub mod moderation;
pub mod net;
pub mod parsers;
pub mod progress;
pub mod scraper;
pub mod sessions;
pub mod signals;
pub mod store;
pub mod task;
pub mod testing;

pub use browser::{
    BrowserAutomation, BrowserError, BrowserLauncher, BrowserResult, BrowserSession,
    CaptureContext, DeviceProfile, FingerprintGenerator, InterceptedResponse,
    PoolFingerprintGenerator, SessionCookie, SessionLauncher, SessionMetrics,
};
pub use capture::{
    capture_bulk_page, capture_page, BulkCapture, CaptureSettings, CaptureTarget,
    CapturedArtifact, DeviceTarget, PageHook,
};
pub use config::{
    load_lookup_config, ApiSection, CaptureSection, ChromiumSection, FingerprintSection,
    LookupConfig, ModerationSection, PathsSection, SessionsSection,
};
pub use error::{CaptureError, CaptureResult, ConfigError, Result};
pub use intercept::{InterceptRouter, InterceptRule};
pub use moderation::{
    AggregatedReport, HttpChatModel, LanguageModel, ModerationError, ModerationItem,
    ModerationPipeline, ScoreAttempt, ScoringOutcome,
};
pub use net::{HttpFetcher, HttpRequest, HttpResponse, ReqwestFetcher};
pub use progress::{ChannelSink, NullSink, ProgressEvent, ProgressSink, ScraperProgress, TaskEvent};
pub use scraper::{CaptureOptions, Platform, Scraper, ScraperDeps, ScraperRegistry};
pub use sessions::{CookieStore, FileCookieStore};
pub use signals::{CancellationFlag, CaptureSignal, CompletionSignals};
pub use store::{RecordMap, RecordStore};
pub use task::{CaptureRequest, ScraperOutcome, ScraperStatus, TaskRunner, TaskSummary};
