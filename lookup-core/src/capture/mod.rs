//! Device-aware screenshot capture and scroll-paginated bulk capture.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, CaptureContext, FingerprintGenerator};
use crate::config::CaptureSection;
use crate::error::{CaptureError, CaptureResult};
use crate::progress::ScraperProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTarget {
    Desktop,
    #[serde(alias = "android")]
    Mobile,
}

impl DeviceTarget {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceTarget::Desktop => "desktop",
            DeviceTarget::Mobile => "mobile",
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DeviceTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceTarget::Desktop),
            "mobile" | "android" => Ok(DeviceTarget::Mobile),
            other => Err(format!("unknown device target `{other}`")),
        }
    }
}

/// A screenshot written to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedArtifact {
    pub path: PathBuf,
    pub url: String,
    pub device: Option<DeviceTarget>,
    pub index: Option<usize>,
    pub captured_at: DateTime<Utc>,
}

impl CapturedArtifact {
    pub fn new(path: PathBuf, url: &str, device: Option<DeviceTarget>, index: Option<usize>) -> Self {
        Self {
            path: absolute(path),
            url: url.to_string(),
            device,
            index,
            captured_at: Utc::now(),
        }
    }
}

/// A URL and the screenshot path it should land on (before the device suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub url: String,
    pub path: PathBuf,
}

impl CaptureTarget {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_targets: Vec<DeviceTarget>,
    pub full_page: bool,
    pub navigation_timeout: Duration,
    pub bulk_delay: Duration,
}

impl From<&CaptureSection> for CaptureSettings {
    fn from(section: &CaptureSection) -> Self {
        Self {
            device_targets: section.device_targets.clone(),
            full_page: section.full_page,
            navigation_timeout: section.navigation_timeout(),
            bulk_delay: section.bulk_delay(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&CaptureSection::default())
    }
}

/// Runs against a freshly opened context before each navigation.
#[async_trait]
pub trait PageHook: Send + Sync {
    async fn before_navigate(&self, context: &dyn CaptureContext) -> CaptureResult<()>;
}

/// `dir/profile.png` + mobile -> `dir/profile_mobile.png`.
pub fn with_device_suffix(path: &Path, device: DeviceTarget) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_{}.{}", device.label(), ext.to_string_lossy()),
        None => format!("{stem}_{}", device.label()),
    };
    path.with_file_name(file_name)
}

/// Screenshot every target once per device. Each device gets its own context,
/// closed after its batch whatever happened inside it.
pub async fn capture_page(
    session: &dyn BrowserSession,
    fingerprints: &dyn FingerprintGenerator,
    settings: &CaptureSettings,
    targets: &[CaptureTarget],
    device_targets: Option<&[DeviceTarget]>,
    hook: Option<&dyn PageHook>,
) -> CaptureResult<Vec<CapturedArtifact>> {
    let requested = device_targets.unwrap_or(&settings.device_targets);
    let mut devices: Vec<DeviceTarget> = Vec::with_capacity(requested.len());
    for device in requested {
        if !devices.contains(device) {
            devices.push(*device);
        }
    }

    let mut artifacts = Vec::new();
    for device in devices {
        let profile = fingerprints.generate(device);
        let context = session.new_context(&profile).await?;
        let batch = capture_batch(context.as_ref(), device, settings, targets, hook).await;
        if let Err(err) = context.close().await {
            warn!(device = %device, error = %err, "failed to close capture context");
        }
        artifacts.extend(batch?);
    }
    Ok(artifacts)
}

async fn capture_batch(
    context: &dyn CaptureContext,
    device: DeviceTarget,
    settings: &CaptureSettings,
    targets: &[CaptureTarget],
    hook: Option<&dyn PageHook>,
) -> CaptureResult<Vec<CapturedArtifact>> {
    let mut artifacts = Vec::with_capacity(targets.len());
    for target in targets {
        if let Some(parent) = target.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CaptureError::file_write(parent, err))?;
        }
        if let Some(hook) = hook {
            hook.before_navigate(context).await?;
        }

        match context
            .navigate(&target.url, settings.navigation_timeout)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_timeout() => {
                warn!(url = %target.url, device = %device, "navigation timed out; capturing what loaded");
            }
            Err(err) => {
                warn!(url = %target.url, device = %device, error = %err, "navigation failed; skipping");
                continue;
            }
        }

        let path = with_device_suffix(&target.path, device);
        if let Err(err) = context.screenshot(&path, settings.full_page).await {
            warn!(path = %path.display(), error = %err, "screenshot failed; skipping");
            continue;
        }
        debug!(path = %path.display(), "captured page");
        artifacts.push(CapturedArtifact::new(
            path,
            &target.url,
            Some(device),
            None,
        ));
    }
    Ok(artifacts)
}

/// Parameters of one scroll-paginated capture.
#[derive(Debug, Clone)]
pub struct BulkCapture<'a> {
    pub source_url: &'a str,
    pub dest_dir: &'a Path,
    pub max_screenshots: usize,
    pub message: &'a str,
}

/// Scroll the current page one viewport at a time, screenshotting each step
/// into `dest_dir/screen-<n>.png`.
///
/// The transient `message` is shown for the duration and cleared afterwards,
/// also on failure.
pub async fn capture_bulk_page(
    context: &dyn CaptureContext,
    progress: &ScraperProgress,
    delay: Duration,
    bulk: BulkCapture<'_>,
) -> CaptureResult<Vec<CapturedArtifact>> {
    tokio::fs::create_dir_all(bulk.dest_dir)
        .await
        .map_err(|err| CaptureError::file_write(bulk.dest_dir, err))?;

    progress.message(bulk.message);
    let outcome = scroll_and_capture(context, delay, &bulk).await;
    progress.message("");
    outcome
}

async fn scroll_and_capture(
    context: &dyn CaptureContext,
    delay: Duration,
    bulk: &BulkCapture<'_>,
) -> CaptureResult<Vec<CapturedArtifact>> {
    let device = context.device().target;
    let mut height = context.scroll_height().await?;
    let viewport = context.viewport_height().await?.max(1.0);
    let mut offset = 0.0;
    let mut artifacts: Vec<CapturedArtifact> = Vec::new();

    while offset < height && artifacts.len() < bulk.max_screenshots {
        info!(offset, height, dest = %bulk.dest_dir.display(), "capturing scroll step");
        context.scroll_to(offset).await?;
        height = context.scroll_height().await?;
        if let Err(err) = context.wait_for_dom_ready().await {
            warn!(error = %err, "page did not settle; capturing anyway");
        }

        let index = artifacts.len();
        let path = bulk.dest_dir.join(format!("screen-{index}.png"));
        context.screenshot(&path, false).await?;
        artifacts.push(CapturedArtifact::new(
            path,
            bulk.source_url,
            Some(device),
            Some(index),
        ));

        tokio::time::sleep(delay).await;
        offset += viewport;
    }
    Ok(artifacts)
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::progress::KEY_MESSAGE;
    use crate::scraper::Platform;
    use crate::testing::{FixedFingerprints, RecordingSink, ScriptedBrowser};
    use tempfile::tempdir;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            bulk_delay: Duration::ZERO,
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn suffix_is_inserted_before_the_extension() {
        assert_eq!(
            with_device_suffix(Path::new("/r/telegram/durov/capture.png"), DeviceTarget::Mobile),
            PathBuf::from("/r/telegram/durov/capture_mobile.png")
        );
        assert_eq!(
            with_device_suffix(Path::new("out/shot"), DeviceTarget::Desktop),
            PathBuf::from("out/shot_desktop")
        );
    }

    #[test]
    fn android_is_an_alias_for_mobile() {
        assert_eq!("android".parse::<DeviceTarget>().unwrap(), DeviceTarget::Mobile);
        assert!("tablet".parse::<DeviceTarget>().is_err());
    }

    #[tokio::test]
    async fn two_devices_yield_two_artifacts_per_url() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new();
        let session = browser.session();
        let targets = vec![
            CaptureTarget::new("https://t.me/durov", dir.path().join("capture.png")),
            CaptureTarget::new("https://t.me/s/news", dir.path().join("news/capture.png")),
        ];

        let artifacts = capture_page(
            &session,
            &FixedFingerprints,
            &settings(),
            &targets,
            Some([DeviceTarget::Desktop, DeviceTarget::Mobile].as_slice()),
            None,
        )
        .await
        .unwrap();

        assert_eq!(artifacts.len(), 4);
        let first: Vec<_> = artifacts
            .iter()
            .filter(|artifact| artifact.url == "https://t.me/durov")
            .map(|artifact| artifact.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(first, vec!["capture_desktop.png", "capture_mobile.png"]);
        assert!(dir.path().join("news/capture_mobile.png").exists());

        let journal = browser.journal();
        assert_eq!(journal.contexts, vec![DeviceTarget::Desktop, DeviceTarget::Mobile]);
        assert_eq!(journal.closed_contexts, 2);
    }

    #[tokio::test]
    async fn navigation_timeout_still_screenshots() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new().timeout_on("slow.example");
        let targets = vec![CaptureTarget::new("https://slow.example/", dir.path().join("p.png"))];
        let artifacts = capture_page(
            &browser.session(),
            &FixedFingerprints,
            &settings(),
            &targets,
            Some([DeviceTarget::Desktop].as_slice()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(dir.path().join("p_desktop.png").exists());
    }

    #[tokio::test]
    async fn failed_navigation_skips_only_that_url() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new().fail_on("broken.example");
        let targets = vec![
            CaptureTarget::new("https://broken.example/", dir.path().join("a.png")),
            CaptureTarget::new("https://fine.example/", dir.path().join("b.png")),
        ];
        let artifacts = capture_page(
            &browser.session(),
            &FixedFingerprints,
            &settings(),
            &targets,
            Some([DeviceTarget::Mobile].as_slice()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].url, "https://fine.example/");
        assert_eq!(browser.journal().closed_contexts, 1);
    }

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl PageHook for CountingHook {
        async fn before_navigate(&self, _context: &dyn CaptureContext) -> CaptureResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_runs_before_every_navigation() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new();
        let hook = CountingHook(AtomicUsize::new(0));
        let targets = vec![CaptureTarget::new("https://a.example/", dir.path().join("a.png"))];
        capture_page(
            &browser.session(),
            &FixedFingerprints,
            &settings(),
            &targets,
            None,
            Some(&hook),
        )
        .await
        .unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bulk_capture_respects_the_cap_on_a_growing_page() {
        let dir = tempdir().unwrap();
        let browser = ScriptedBrowser::new().with_growing_page(10_000.0);
        let session = browser.session();
        let context = session
            .new_context(&FixedFingerprints.generate(DeviceTarget::Mobile))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let progress = ScraperProgress::new(Platform::Twitter, sink.clone());

        let artifacts = capture_bulk_page(
            context.as_ref(),
            &progress,
            Duration::ZERO,
            BulkCapture {
                source_url: "https://x.com/jack",
                dest_dir: &dir.path().join("tweets"),
                max_screenshots: 4,
                message: "Capturing tweets",
            },
        )
        .await
        .unwrap();

        assert_eq!(artifacts.len(), 4);
        assert_eq!(artifacts[3].index, Some(3));
        assert!(dir.path().join("tweets/screen-3.png").exists());

        let messages: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|event| event.service_key() == Some((Platform::Twitter, KEY_MESSAGE)))
            .collect();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn bulk_capture_stops_at_the_end_of_a_short_page() {
        let dir = tempdir().unwrap();
        // viewport of the fixed mobile profile is 800px
        let browser = ScriptedBrowser::new().with_page_height(2_000.0);
        let session = browser.session();
        let context = session
            .new_context(&FixedFingerprints.generate(DeviceTarget::Mobile))
            .await
            .unwrap();
        let progress = ScraperProgress::new(Platform::Twitter, Arc::new(RecordingSink::default()));
        let artifacts = capture_bulk_page(
            context.as_ref(),
            &progress,
            Duration::ZERO,
            BulkCapture {
                source_url: "https://x.com/jack/followers",
                dest_dir: &dir.path().join("followers"),
                max_screenshots: 10,
                message: "Capturing followers",
            },
        )
        .await
        .unwrap();
        assert_eq!(artifacts.len(), 3);
    }
}
