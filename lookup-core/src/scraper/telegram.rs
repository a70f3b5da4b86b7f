use std::path::Path;

use async_trait::async_trait;
use ::scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{ensure_dir, profile_dir, CaptureOptions, Platform, Scraper, ScraperDeps};
use crate::browser::BrowserSession;
use crate::capture::{capture_page, CaptureTarget, CapturedArtifact};
use crate::error::{CaptureError, CaptureResult};
use crate::net::HttpRequest;
use crate::parsers::mentions_to_follow;
use crate::progress::{ScraperProgress, KEY_API_DATA, KEY_PROFILE_IMAGE};
use crate::store::RecordStore;

const BASE_URL: &str = "https://t.me";

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    document
        .select(&selector(css))
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
}

/// Summary of a public `t.me/<name>` page.
pub fn parse_profile_page(html: &str) -> Value {
    let document = Html::parse_document(html);
    let mut profile = Map::new();
    if let Some(name) = first_text(&document, "div.tgme_page_title") {
        profile.insert("name".into(), Value::String(name));
    }
    if let Some(description) = first_text(&document, "div.tgme_page_description") {
        profile.insert("description".into(), Value::String(description));
    }
    if let Some(src) = document
        .select(&selector("img.tgme_page_photo_image"))
        .next()
        .and_then(|image| image.value().attr("src"))
    {
        profile.insert("image_url".into(), Value::String(src.to_string()));
    }
    let extra = first_text(&document, "div.tgme_page_extra").unwrap_or_default();
    let kind = if extra.contains("members") {
        "group"
    } else if extra.contains("subscribers") {
        "channel"
    } else {
        "user"
    };
    profile.insert("meta".into(), Value::String(extra));
    profile.insert("type".into(), Value::String(kind.into()));
    Value::Object(profile)
}

pub struct TelegramScraper {
    identity: String,
    deps: ScraperDeps,
    progress: ScraperProgress,
}

impl TelegramScraper {
    pub fn new(identity: String, deps: ScraperDeps) -> Self {
        let progress = deps.progress(Platform::Telegram);
        Self {
            identity,
            deps,
            progress,
        }
    }

    async fn snapshot_profile(&self, dir: &Path) -> CaptureResult<Value> {
        let mut profile = self.fetch_structured_data(&self.identity).await?;
        self.progress.send(KEY_API_DATA, profile.clone());

        let image_url = profile
            .get("image_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let (true, Some(url)) = (self.deps.config.capture.store_profile_images, image_url) {
            let dest = dir.join("profile.png");
            match self.deps.fetcher.download(&url, &dest).await {
                Ok(path) => {
                    let path = path.display().to_string();
                    self.progress.send(KEY_PROFILE_IMAGE, Value::String(path.clone()));
                    profile["image_path"] = Value::String(path);
                }
                Err(err) => warn!(identity = %self.identity, error = %err, "profile image download failed"),
            }
        }

        if let Err(err) = RecordStore::new(dir).write("api_data", &profile).await {
            warn!(identity = %self.identity, error = %err, "failed to store profile snapshot");
        }
        Ok(profile)
    }

    /// Pages of accounts mentioned in `description`. Channels get their
    /// public preview (`t.me/s/<name>`).
    async fn mentioned_targets(&self, description: &str, dir: &Path) -> Vec<CaptureTarget> {
        let mut targets = Vec::new();
        for handle in mentions_to_follow(Platform::Telegram, &self.identity, description) {
            let kind = match self.fetch_structured_data(&handle).await {
                Ok(profile) => profile
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_string(),
                Err(err) => {
                    warn!(handle = %handle, error = %err, "mentioned profile lookup failed");
                    "user".to_string()
                }
            };
            let url = if kind == "channel" {
                format!("{BASE_URL}/s/{handle}")
            } else {
                format!("{BASE_URL}/{handle}")
            };
            targets.push(CaptureTarget::new(url, dir.join(&handle).join("capture.png")));
        }
        targets
    }
}

#[async_trait]
impl Scraper for TelegramScraper {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_structured_data(&self, identity: &str) -> CaptureResult<Value> {
        let response = self
            .deps
            .fetcher
            .get_text(HttpRequest::get(format!("{BASE_URL}/{identity}")))
            .await?;
        if !response.is_success() {
            return Err(CaptureError::NotAvailable(format!(
                "t.me/{identity} answered {}",
                response.status
            )));
        }
        Ok(parse_profile_page(&response.body))
    }

    async fn capture(
        &self,
        output_root: &Path,
        session: &dyn BrowserSession,
        options: &CaptureOptions,
    ) -> CaptureResult<Vec<CapturedArtifact>> {
        info!(identity = %self.identity, "capturing telegram profile");
        let dir = profile_dir(output_root, Platform::Telegram, &self.identity);
        ensure_dir(&dir).await?;

        let mut profile = None;
        if options.store_api_responses {
            match self.snapshot_profile(&dir).await {
                Ok(snapshot) => profile = Some(snapshot),
                Err(err) => {
                    warn!(identity = %self.identity, error = %err, "profile snapshot unavailable");
                    self.progress.error(err.kind(), err.to_string());
                }
            }
        }

        let mut targets = vec![CaptureTarget::new(
            format!("{BASE_URL}/{}", self.identity),
            dir.join("capture.png"),
        )];
        if options.in_depth {
            if profile.is_none() {
                profile = self.fetch_structured_data(&self.identity).await.ok();
            }
            let description = profile
                .as_ref()
                .and_then(|profile| profile.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            targets.extend(self.mentioned_targets(description, &dir).await);
        }

        self.deps.cancel.checkpoint()?;
        let settings = self.deps.capture_settings(options);
        let artifacts = capture_page(
            session,
            self.deps.fingerprints.as_ref(),
            &settings,
            &targets,
            None,
            None,
        )
        .await?;
        let paths: Vec<_> = artifacts.iter().map(|artifact| &artifact.path).collect();
        self.progress.images(&paths);
        info!(identity = %self.identity, screenshots = artifacts.len(), "telegram capture finished");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL_PAGE: &str = r#"
        <html><body>
          <div class="tgme_page_photo"><img class="tgme_page_photo_image" src="https://cdn.tg/durov.jpg"></div>
          <div class="tgme_page_title"><span dir="auto">Durov's Channel</span></div>
          <div class="tgme_page_extra">1 234 567 subscribers</div>
          <div class="tgme_page_description">Thoughts. Backup at @durov_backup</div>
        </body></html>
    "#;

    #[test]
    fn parses_a_channel_page() {
        let profile = parse_profile_page(CHANNEL_PAGE);
        assert_eq!(profile["name"], "Durov's Channel");
        assert_eq!(profile["type"], "channel");
        assert_eq!(profile["image_url"], "https://cdn.tg/durov.jpg");
        assert_eq!(profile["description"], "Thoughts. Backup at @durov_backup");
    }

    #[test]
    fn groups_and_users_are_told_apart() {
        let group = parse_profile_page(r#"<div class="tgme_page_extra">52 members, 3 online</div>"#);
        assert_eq!(group["type"], "group");
        let user = parse_profile_page(r#"<div class="tgme_page_title">Someone</div>"#);
        assert_eq!(user["type"], "user");
        assert!(user.get("image_url").is_none());
    }
}
