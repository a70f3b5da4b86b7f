use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::capture::DeviceTarget;
use crate::config::FingerprintSection;

/// Signals a context presents to pages: viewport, user agent and platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub target: DeviceTarget,
    pub user_agent: String,
    pub platform: String,
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
    pub has_touch: bool,
}

impl DeviceProfile {
    /// Script installed before any page script runs so `navigator` agrees with
    /// the emulated user agent.
    pub fn navigator_script(&self) -> String {
        let touch_points = if self.has_touch { 5 } else { 0 };
        format!(
            r#"
(() => {{
    Object.defineProperty(navigator, 'platform', {{ get: () => '{platform}' }});
    Object.defineProperty(navigator, 'maxTouchPoints', {{ get: () => {touch_points} }});
    Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
}})();
"#,
            platform = self.platform.replace('\'', ""),
        )
    }
}

/// Produces device fingerprints for new contexts. Injected so tests can pin them.
pub trait FingerprintGenerator: Send + Sync {
    fn generate(&self, target: DeviceTarget) -> DeviceProfile;
}

/// Draws viewports and user agents from the configured pools with a little
/// pixel jitter, so consecutive contexts do not look identical.
#[derive(Debug, Clone)]
pub struct PoolFingerprintGenerator {
    config: FingerprintSection,
}

impl PoolFingerprintGenerator {
    pub fn new(config: FingerprintSection) -> Self {
        Self { config }
    }

    fn select_user_agent(&self, target: DeviceTarget) -> String {
        let mut rng = rand::thread_rng();
        let pool = match target {
            DeviceTarget::Desktop => &self.config.desktop_user_agents,
            DeviceTarget::Mobile => &self.config.mobile_user_agents,
        };
        pool.choose(&mut rng).cloned().unwrap_or_else(|| match target {
            DeviceTarget::Desktop => "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            DeviceTarget::Mobile => "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36".to_string(),
        })
    }

    fn select_viewport(&self, target: DeviceTarget) -> (u32, u32) {
        let mut rng = rand::thread_rng();
        let (pool, fallback, min, max) = match target {
            DeviceTarget::Desktop => (
                &self.config.desktop_viewports,
                [1366, 768],
                [800u32, 600u32],
                [2560u32, 1600u32],
            ),
            DeviceTarget::Mobile => (
                &self.config.mobile_viewports,
                [412, 915],
                [320, 568],
                [600, 1400],
            ),
        };
        let base = pool.choose(&mut rng).copied().unwrap_or(fallback);
        let jitter = self.config.jitter_pixels as i64;
        let width = (base[0] as i64 + rng.gen_range(-jitter..=jitter)).clamp(min[0] as i64, max[0] as i64);
        let height = (base[1] as i64 + rng.gen_range(-jitter..=jitter)).clamp(min[1] as i64, max[1] as i64);
        (width as u32, height as u32)
    }
}

fn platform_for(user_agent: &str, target: DeviceTarget) -> String {
    match target {
        DeviceTarget::Mobile if user_agent.contains("iPhone") => "iPhone".into(),
        DeviceTarget::Mobile => "Linux armv8l".into(),
        DeviceTarget::Desktop if user_agent.contains("Windows") => "Win32".into(),
        DeviceTarget::Desktop if user_agent.contains("Macintosh") => "MacIntel".into(),
        DeviceTarget::Desktop => "Linux x86_64".into(),
    }
}

impl FingerprintGenerator for PoolFingerprintGenerator {
    fn generate(&self, target: DeviceTarget) -> DeviceProfile {
        let user_agent = self.select_user_agent(target);
        let (width, height) = self.select_viewport(target);
        let platform = platform_for(&user_agent, target);
        let device_scale_factor = match target {
            DeviceTarget::Desktop => 1.0,
            DeviceTarget::Mobile => {
                let [low, high] = self.config.mobile_scale_factor;
                let (low, high) = (low.min(high), low.max(high));
                rand::thread_rng().gen_range(low..=high) as f64
            }
        };
        DeviceProfile {
            target,
            user_agent,
            platform,
            width,
            height,
            device_scale_factor,
            mobile: target == DeviceTarget::Mobile,
            has_touch: target == DeviceTarget::Mobile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mobile_profiles_use_mobile_signals() {
        let generator = PoolFingerprintGenerator::new(FingerprintSection::default());
        let profile = generator.generate(DeviceTarget::Mobile);
        assert!(profile.mobile);
        assert!(profile.has_touch);
        assert!(profile.user_agent.contains("Mobile"));
        assert_eq!(profile.platform, "Linux armv8l");
        assert!(profile.width < 700);
        assert!(profile.device_scale_factor >= 2.6);
    }

    #[test]
    fn desktop_profiles_follow_the_user_agent_platform() {
        let generator = PoolFingerprintGenerator::new(FingerprintSection {
            desktop_user_agents: vec!["Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4)".into()],
            ..FingerprintSection::default()
        });
        let profile = generator.generate(DeviceTarget::Desktop);
        assert!(!profile.mobile);
        assert_eq!(profile.platform, "MacIntel");
        assert_eq!(profile.device_scale_factor, 1.0);
        assert!(profile.navigator_script().contains("'MacIntel'"));
    }

    #[test]
    fn empty_pools_fall_back_to_builtin_values() {
        let generator = PoolFingerprintGenerator::new(FingerprintSection {
            desktop_user_agents: vec![],
            desktop_viewports: vec![],
            jitter_pixels: 0,
            ..FingerprintSection::default()
        });
        let profile = generator.generate(DeviceTarget::Desktop);
        assert_eq!((profile.width, profile.height), (1366, 768));
        assert!(profile.user_agent.contains("Windows"));
    }
}
