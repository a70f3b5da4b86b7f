//! Plain HTTP access used outside the browser: profile endpoints, avatar
//! downloads and short-link resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::browser::SessionCookie;
use crate::error::{CaptureError, CaptureResult};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn cookies(self, cookies: &[SessionCookie]) -> Self {
        if cookies.is_empty() {
            return self;
        }
        self.header("Cookie", cookie_header(cookies))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub fn cookie_header(cookies: &[SessionCookie]) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get_text(&self, request: HttpRequest) -> CaptureResult<HttpResponse>;

    /// Save the body of `url` to `dest`, creating parent directories.
    async fn download(&self, url: &str, dest: &Path) -> CaptureResult<PathBuf>;

    /// Follow redirects and return the final URL.
    async fn resolve_redirects(&self, url: &str) -> CaptureResult<String>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> CaptureResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

fn map_transport(url: &str, err: reqwest::Error) -> CaptureError {
    if err.is_timeout() {
        CaptureError::Timeout(url.to_string())
    } else {
        CaptureError::Http(err)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get_text(&self, request: HttpRequest) -> CaptureResult<HttpResponse> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|err| map_transport(&request.url, err))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| map_transport(&request.url, err))?;
        debug!(url = %request.url, status, bytes = body.len(), "fetched");
        Ok(HttpResponse { status, body })
    }

    async fn download(&self, url: &str, dest: &Path) -> CaptureResult<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| map_transport(url, err))?
            .error_for_status()?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_transport(url, err))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CaptureError::file_write(parent, err))?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|err| CaptureError::file_write(dest, err))?;
        Ok(dest.to_path_buf())
    }

    async fn resolve_redirects(&self, url: &str) -> CaptureResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| map_transport(url, err))?;
        Ok(response.url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_joins_pairs() {
        let cookies = vec![
            SessionCookie::new("auth_token", "abc", ".x.com"),
            SessionCookie::new("ct0", "csrf", ".x.com"),
        ];
        assert_eq!(cookie_header(&cookies), "auth_token=abc; ct0=csrf");
        let request = HttpRequest::get("https://x.com").cookies(&cookies);
        assert_eq!(request.headers[0].0, "Cookie");
    }

    #[test]
    fn no_cookies_means_no_header() {
        let request = HttpRequest::get("https://t.me/durov").cookies(&[]);
        assert!(request.headers.is_empty());
    }
}
