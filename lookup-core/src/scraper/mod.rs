//! Per-platform scrapers and the registry the task runner creates them from.

mod facebook;
mod instagram;
mod telegram;
mod twitter;
mod whatsapp;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use facebook::FacebookScraper;
pub use instagram::InstagramScraper;
pub use telegram::{parse_profile_page, TelegramScraper};
pub use twitter::{SessionState, TwitterScraper};
pub use whatsapp::WhatsappScraper;

use crate::browser::{BrowserSession, FingerprintGenerator};
use crate::capture::{capture_page, CaptureSettings, CaptureTarget, CapturedArtifact, DeviceTarget};
use crate::config::LookupConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::moderation::ModerationPipeline;
use crate::net::HttpFetcher;
use crate::progress::{ProgressSink, ScraperProgress};
use crate::sessions::CookieStore;
use crate::signals::CancellationFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Instagram,
    Twitter,
    Facebook,
    Whatsapp,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Telegram,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Facebook,
        Platform::Whatsapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|platform| platform.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown platform `{value}`"))
    }
}

/// Per-task capture switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Persist JSON records and fetch profile data. `false` is screenshot-only mode.
    pub store_api_responses: bool,
    /// Follow @-mentions found in the profile text.
    pub in_depth: bool,
    /// Devices to capture on; empty means the configured default.
    pub device_targets: Vec<DeviceTarget>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            store_api_responses: true,
            in_depth: false,
            device_targets: Vec::new(),
        }
    }
}

/// Services injected into every scraper of a task.
#[derive(Clone)]
pub struct ScraperDeps {
    pub config: Arc<LookupConfig>,
    pub fingerprints: Arc<dyn FingerprintGenerator>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub cookies: Arc<dyn CookieStore>,
    pub moderation: Option<Arc<ModerationPipeline>>,
    pub sink: Arc<dyn ProgressSink>,
    pub cancel: CancellationFlag,
}

impl ScraperDeps {
    pub fn progress(&self, platform: Platform) -> ScraperProgress {
        ScraperProgress::new(platform, Arc::clone(&self.sink))
    }

    pub fn capture_settings(&self, options: &CaptureOptions) -> CaptureSettings {
        let mut settings = CaptureSettings::from(&self.config.capture);
        if !options.device_targets.is_empty() {
            settings.device_targets = options.device_targets.clone();
        }
        settings
    }
}

/// An identity must name a single directory below `<output_root>/<platform>`.
pub fn validate_identity(identity: &str) -> CaptureResult<()> {
    let invalid = identity.is_empty()
        || identity.starts_with('.')
        || identity.contains(['/', '\\', '\0'])
        || identity.contains("..")
        || Path::new(identity).is_absolute();
    if invalid {
        Err(CaptureError::InvalidIdentity(identity.to_string()))
    } else {
        Ok(())
    }
}

/// `<output_root>/<platform>/<identity>`
pub fn profile_dir(output_root: &Path, platform: Platform, identity: &str) -> PathBuf {
    output_root.join(platform.as_str()).join(identity)
}

pub(crate) async fn ensure_dir(dir: &Path) -> CaptureResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| CaptureError::file_write(dir, err))
}

/// Screenshot one public page into `<dir>/capture.png` and announce it.
pub(crate) async fn capture_public_page(
    deps: &ScraperDeps,
    progress: &ScraperProgress,
    dir: &Path,
    url: String,
    session: &dyn BrowserSession,
    options: &CaptureOptions,
) -> CaptureResult<Vec<CapturedArtifact>> {
    ensure_dir(dir).await?;
    deps.cancel.checkpoint()?;
    let targets = [CaptureTarget::new(url, dir.join("capture.png"))];
    let artifacts = capture_page(
        session,
        deps.fingerprints.as_ref(),
        &deps.capture_settings(options),
        &targets,
        None,
        None,
    )
    .await?;
    let paths: Vec<_> = artifacts.iter().map(|artifact| &artifact.path).collect();
    progress.images(&paths);
    Ok(artifacts)
}

/// One platform's capture capability.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn platform(&self) -> Platform;

    fn identity(&self) -> &str;

    /// Profile data fetched without the browser.
    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value>;

    /// Write artifacts under `output_root/<platform>/<identity>/`. The session is
    /// borrowed: scrapers never shut it down.
    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>>;

    /// Runs after every scraper of the task finished capturing.
    async fn post_task(&self) -> CaptureResult<()> {
        Ok(())
    }
}

pub type ScraperConstructor = fn(String, ScraperDeps) -> Box<dyn Scraper>;

/// Platform -> constructor table.
#[derive(Clone, Default)]
pub struct ScraperRegistry {
    constructors: BTreeMap<Platform, ScraperConstructor>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in platform.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Platform::Telegram, |identity, deps| {
            Box::new(TelegramScraper::new(identity, deps))
        });
        registry.register(Platform::Instagram, |identity, deps| {
            Box::new(InstagramScraper::new(identity, deps))
        });
        registry.register(Platform::Twitter, |identity, deps| {
            Box::new(TwitterScraper::new(identity, deps))
        });
        registry.register(Platform::Facebook, |identity, deps| {
            Box::new(FacebookScraper::new(identity, deps))
        });
        registry.register(Platform::Whatsapp, |identity, deps| {
            Box::new(WhatsappScraper::new(identity, deps))
        });
        registry
    }

    pub fn register(&mut self, platform: Platform, constructor: ScraperConstructor) {
        self.constructors.insert(platform, constructor);
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.constructors.keys().copied().collect()
    }

    pub fn create(
        &self,
        platform: Platform,
        identity: impl Into<String>,
        deps: ScraperDeps,
    ) -> Option<Box<dyn Scraper>> {
        self.constructors
            .get(&platform)
            .map(|constructor| constructor(identity.into(), deps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_deps;

    #[test]
    fn platform_names_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert_eq!("Twitter".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn default_registry_builds_every_platform() {
        let registry = ScraperRegistry::with_defaults();
        assert_eq!(registry.platforms().len(), 5);
        let (deps, _sink) = test_deps();
        let scraper = registry.create(Platform::Whatsapp, "15551234567", deps).unwrap();
        assert_eq!(scraper.platform(), Platform::Whatsapp);
        assert_eq!(scraper.identity(), "15551234567");
    }

    #[test]
    fn requested_devices_override_configured_ones() {
        let (deps, _sink) = test_deps();
        let options = CaptureOptions {
            device_targets: vec![DeviceTarget::Mobile],
            ..CaptureOptions::default()
        };
        assert_eq!(deps.capture_settings(&options).device_targets, vec![DeviceTarget::Mobile]);
        assert_eq!(deps.capture_settings(&CaptureOptions::default()).device_targets.len(), 2);
    }

    #[test]
    fn identities_that_leave_the_platform_dir_are_rejected() {
        for identity in ["../../../escaped", "/tmp/x", "a/b", "a\\b", ".hidden", "..", "x..y"] {
            assert!(
                matches!(validate_identity(identity), Err(CaptureError::InvalidIdentity(_))),
                "{identity} accepted"
            );
        }
        for identity in ["durov", "jack_2", "+1 555 0100", "some.one"] {
            assert!(validate_identity(identity).is_ok(), "{identity} rejected");
        }
    }

    #[test]
    fn profile_dir_layout() {
        assert_eq!(
            profile_dir(Path::new("/r/abc"), Platform::Telegram, "durov"),
            PathBuf::from("/r/abc/telegram/durov")
        );
    }
}
