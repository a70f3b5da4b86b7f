use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{capture_public_page, profile_dir, CaptureOptions, Platform, Scraper, ScraperDeps};
use crate::browser::BrowserSession;
use crate::capture::CapturedArtifact;
use crate::error::{CaptureError, CaptureResult};
use crate::progress::ScraperProgress;

pub struct FacebookScraper {
    identity: String,
    deps: ScraperDeps,
    progress: ScraperProgress,
}

impl FacebookScraper {
    pub fn new(identity: String, deps: ScraperDeps) -> Self {
        let progress = deps.progress(Platform::Facebook);
        Self {
            identity,
            deps,
            progress,
        }
    }
}

#[async_trait]
impl Scraper for FacebookScraper {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value> {
        Err(CaptureError::NotAvailable(format!(
            "facebook has no public profile data for {identity}"
        )))
    }

    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        info!(identity = %self.identity, "capturing facebook profile");
        let dir = profile_dir(output_root, Platform::Facebook, &self.identity);
        capture_public_page(
            &self.deps,
            &self.progress,
            &dir,
            format!("https://www.facebook.com/{}", self.identity),
            session,
            options,
        )
        .await
    }
}
