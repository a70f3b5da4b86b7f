use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::capture::DeviceTarget;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LookupConfig {
    pub paths: PathsSection,
    pub capture: CaptureSection,
    pub chromium: ChromiumSection,
    pub fingerprint: FingerprintSection,
    pub sessions: SessionsSection,
    pub api: ApiSection,
    pub moderation: ModerationSection,
}

impl LookupConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn result_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.result_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub result_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            result_dir: "results".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub device_targets: Vec<DeviceTarget>,
    pub full_page: bool,
    pub store_profile_images: bool,
    pub navigation_timeout_ms: u64,
    pub profile_navigation_timeout_ms: u64,
    pub bulk_max_screenshots: usize,
    pub bulk_delay_ms: u64,
    pub signal_deadline_seconds: u64,
    pub close_jitter_ms: [u64; 2],
}

impl CaptureSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn profile_navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_navigation_timeout_ms)
    }

    pub fn bulk_delay(&self) -> Duration {
        Duration::from_millis(self.bulk_delay_ms)
    }

    pub fn signal_deadline(&self) -> Duration {
        Duration::from_secs(self.signal_deadline_seconds)
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            device_targets: vec![DeviceTarget::Desktop, DeviceTarget::Mobile],
            full_page: false,
            store_profile_images: true,
            navigation_timeout_ms: 10_000,
            profile_navigation_timeout_ms: 20_000,
            bulk_max_screenshots: 10,
            bulk_delay_ms: 500,
            signal_deadline_seconds: 60,
            close_jitter_ms: [1_000, 5_000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
    pub disable_automation_controlled: bool,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            request_timeout_seconds: Some(30),
            lang: Some("en-US".into()),
            accept_language: Some("en-US,en;q=0.9".into()),
            disable_automation_controlled: true,
        }
    }
}

/// Pools the device fingerprint generator draws from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintSection {
    pub desktop_user_agents: Vec<String>,
    pub mobile_user_agents: Vec<String>,
    pub desktop_viewports: Vec<[u32; 2]>,
    pub mobile_viewports: Vec<[u32; 2]>,
    pub jitter_pixels: u32,
    pub mobile_scale_factor: [f32; 2],
}

impl Default for FingerprintSection {
    fn default() -> Self {
        Self {
            desktop_user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".into(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".into(),
            ],
            mobile_user_agents: vec![
                "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36".into(),
                "Mozilla/5.0 (Linux; Android 13; SM-S911B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36".into(),
            ],
            desktop_viewports: vec![[1366, 768], [1440, 900], [1920, 1080]],
            mobile_viewports: vec![[412, 915], [393, 873], [360, 800]],
            jitter_pixels: 8,
            mobile_scale_factor: [2.6, 3.0],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub twitter_accounts_dir: Option<String>,
    pub instagram_cookies_path: Option<String>,
}

/// Direct (browser-less) profile endpoints. Unset entries disable the fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub twitter_user_endpoint: Option<String>,
    pub twitter_bearer_token: Option<String>,
    pub instagram_profile_endpoint: String,
    pub instagram_app_id: Option<String>,
    pub request_timeout_seconds: u64,
}

impl ApiSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            twitter_user_endpoint: None,
            twitter_bearer_token: None,
            instagram_profile_endpoint:
                "https://www.instagram.com/api/v1/users/web_profile_info/".into(),
            instagram_app_id: None,
            request_timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModerationSection {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub chunk_size: usize,
    pub max_attempts: usize,
    pub request_timeout_seconds: u64,
    pub resolve_short_links: bool,
}

impl ModerationSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

impl Default for ModerationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.groq.com/openai/v1/chat/completions".into(),
            model: "llama-3.1-8b-instant".into(),
            api_key_env: "GROQ_TOKEN".into(),
            chunk_size: 10,
            max_attempts: 3,
            request_timeout_seconds: 60,
            resolve_short_links: true,
        }
    }
}

pub fn load_lookup_config<P: AsRef<Path>>(path: P) -> Result<LookupConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
