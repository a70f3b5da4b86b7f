use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{capture_public_page, profile_dir, CaptureOptions, Platform, Scraper, ScraperDeps};
use crate::browser::BrowserSession;
use crate::capture::CapturedArtifact;
use crate::error::{CaptureError, CaptureResult};
use crate::progress::ScraperProgress;

/// Keeps the digits of a phone number, the form `wa.me` links expect.
pub fn click_to_chat_number(identity: &str) -> String {
    identity.chars().filter(char::is_ascii_digit).collect()
}

pub struct WhatsappScraper {
    identity: String,
    deps: ScraperDeps,
    progress: ScraperProgress,
}

impl WhatsappScraper {
    pub fn new(identity: String, deps: ScraperDeps) -> Self {
        let progress = deps.progress(Platform::Whatsapp);
        Self {
            identity,
            deps,
            progress,
        }
    }
}

#[async_trait]
impl Scraper for WhatsappScraper {
    fn platform(&self) -> Platform {
        Platform::Whatsapp
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value> {
        Err(CaptureError::NotAvailable(format!(
            "whatsapp exposes no profile data for {identity}"
        )))
    }

    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        let number = click_to_chat_number(&self.identity);
        if number.is_empty() {
            return Err(CaptureError::NotAvailable(format!(
                "`{}` is not a phone number",
                self.identity
            )));
        }
        info!(number = %number, "capturing whatsapp click-to-chat page");
        let dir = profile_dir(output_root, Platform::Whatsapp, &number);
        capture_public_page(
            &self.deps,
            &self.progress,
            &dir,
            format!("https://wa.me/{number}"),
            session,
            options,
        )
        .await
    }
}
