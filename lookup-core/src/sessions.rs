//! Saved platform cookies. Acquiring them (logging in) happens elsewhere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::browser::SessionCookie;
use crate::config::SessionsSection;
use crate::error::{CaptureError, CaptureResult};

pub const TWITTER_COOKIE_DOMAIN: &str = ".x.com";

#[async_trait]
pub trait CookieStore: Send + Sync {
    /// Cookies of one randomly chosen saved Twitter account, or `None` when no
    /// account is stored.
    async fn twitter_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>>;

    async fn instagram_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>>;
}

/// Cookie files on local disk.
#[derive(Debug, Clone, Default)]
pub struct FileCookieStore {
    twitter_accounts_dir: Option<PathBuf>,
    instagram_cookies_path: Option<PathBuf>,
}

impl FileCookieStore {
    pub fn new(twitter_accounts_dir: Option<PathBuf>, instagram_cookies_path: Option<PathBuf>) -> Self {
        Self {
            twitter_accounts_dir,
            instagram_cookies_path,
        }
    }

    pub fn from_config(section: &SessionsSection, resolve: impl Fn(&str) -> PathBuf) -> Self {
        Self {
            twitter_accounts_dir: section.twitter_accounts_dir.as_deref().map(&resolve),
            instagram_cookies_path: section.instagram_cookies_path.as_deref().map(&resolve),
        }
    }
}

/// Accepted layouts of a saved cookie file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CookieFile {
    Wrapped { cookies: Vec<SessionCookie> },
    List(Vec<SessionCookie>),
    Pairs(BTreeMap<String, String>),
}

/// Parse a cookie file. Bare `name -> value` maps get `default_domain`.
pub fn parse_cookie_file(content: &str, default_domain: &str) -> CaptureResult<Vec<SessionCookie>> {
    let parsed: CookieFile = serde_json::from_str(content)
        .map_err(|err| CaptureError::MalformedRemotePayload(format!("cookie file: {err}")))?;
    Ok(match parsed {
        CookieFile::Wrapped { cookies } | CookieFile::List(cookies) => cookies,
        CookieFile::Pairs(pairs) => pairs
            .into_iter()
            .map(|(name, value)| SessionCookie::new(name, value, default_domain))
            .collect(),
    })
}

async fn read_cookie_file(path: &Path, default_domain: &str) -> CaptureResult<Vec<SessionCookie>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|err| {
        CaptureError::MissingCredentials(format!("{}: {err}", path.display()))
    })?;
    parse_cookie_file(&content, default_domain)
}

#[async_trait]
impl CookieStore for FileCookieStore {
    async fn twitter_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>> {
        let Some(dir) = &self.twitter_accounts_dir else {
            return Ok(None);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "twitter accounts directory unreadable");
                return Ok(None);
            }
        };
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CaptureError::MissingCredentials(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
        let Some(chosen) = files.choose(&mut rand::thread_rng()) else {
            return Ok(None);
        };
        debug!(file = %chosen.display(), "using saved twitter account");
        // Cookies from an account file are always re-scoped to the x.com domain.
        let cookies = read_cookie_file(chosen, TWITTER_COOKIE_DOMAIN)
            .await?
            .into_iter()
            .map(|cookie| SessionCookie::new(cookie.name, cookie.value, TWITTER_COOKIE_DOMAIN))
            .collect();
        Ok(Some(cookies))
    }

    async fn instagram_cookies(&self) -> CaptureResult<Option<Vec<SessionCookie>>> {
        match &self.instagram_cookies_path {
            Some(path) if path.exists() => {
                Ok(Some(read_cookie_file(path, ".instagram.com").await?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn all_three_layouts_parse() {
        let wrapped = r#"{"cookies": [{"name": "ct0", "value": "a", "domain": ".x.com"}]}"#;
        let list = r#"[{"name": "ct0", "value": "a", "domain": ".x.com", "httpOnly": true}]"#;
        let pairs = r#"{"auth_token": "t", "ct0": "a"}"#;

        assert_eq!(parse_cookie_file(wrapped, ".x.com").unwrap()[0].name, "ct0");
        assert!(parse_cookie_file(list, ".x.com").unwrap()[0].http_only);
        let parsed = parse_cookie_file(pairs, ".x.com").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|cookie| cookie.domain == ".x.com" && cookie.path == "/"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_cookie_file("[1, 2]", ".x.com"),
            Err(CaptureError::MalformedRemotePayload(_))
        ));
    }

    #[tokio::test]
    async fn twitter_cookies_come_from_a_saved_account() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("alice.json"), r#"{"auth_token": "t", "ct0": "c"}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let store = FileCookieStore::new(Some(dir.path().to_path_buf()), None);
        let cookies = store.twitter_cookies().await.unwrap().unwrap();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|cookie| cookie.domain == TWITTER_COOKIE_DOMAIN));
    }

    #[tokio::test]
    async fn empty_accounts_directory_yields_none() {
        let dir = tempdir().unwrap();
        let store = FileCookieStore::new(Some(dir.path().to_path_buf()), None);
        assert!(store.twitter_cookies().await.unwrap().is_none());
        assert!(store.instagram_cookies().await.unwrap().is_none());
    }
}
