//! Browserless backend
//!
//! Renders pages with headless Chrome through the Browserless `/content`
//! API. The target page's own status code is reported by Browserless in
//! the `X-Response-Code` header.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{BrowserBackend, BrowserSession, FetchError, RenderedPage};

/// Extra time granted to the HTTP request beyond the page-readiness timeout
const REQUEST_GRACE: Duration = Duration::from_secs(5);

/// Bound on the `/json/version` check made when a session is opened
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Browserless `/content` backend
pub struct BrowserlessBackend {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    next_session: AtomicU64,
}

impl BrowserlessBackend {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::SessionUnavailable(format!("HTTP client: {e}")))?;

        let base_url = Url::parse(base_url).map_err(|e| {
            FetchError::SessionUnavailable(format!("Browserless URL {base_url}: {e}"))
        })?;

        Ok(Self {
            client,
            base_url,
            token: token.map(String::from),
            next_session: AtomicU64::new(1),
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut endpoint = self.base_url.clone();
        let base_path = endpoint.path().trim_end_matches('/').to_string();
        endpoint.set_path(&format!("{base_path}{path}"));
        if let Some(ref token) = self.token {
            endpoint.query_pairs_mut().append_pair("token", token);
        }
        endpoint
    }
}

#[async_trait]
impl BrowserBackend for BrowserlessBackend {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, FetchError> {
        let resp = self
            .client
            .get(self.endpoint("/json/version"))
            .timeout(VERSION_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(VERSION_CHECK_TIMEOUT.as_millis() as u64)
                } else {
                    FetchError::SessionUnavailable(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(FetchError::SessionUnavailable(format!(
                "Browserless answered {}",
                resp.status()
            )));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "Browserless session ready");

        Ok(Box::new(BrowserlessSession {
            id,
            client: self.client.clone(),
            endpoint: self.endpoint("/content"),
        }))
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    goto_options: GotoOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    timeout: u64,
    wait_until: &'static str,
}

struct BrowserlessSession {
    id: u64,
    client: reqwest::Client,
    endpoint: Url,
}

#[async_trait]
impl BrowserSession for BrowserlessSession {
    async fn render(&mut self, url: &Url, timeout: Duration) -> Result<RenderedPage, FetchError> {
        let body = ContentRequest {
            url: url.as_str(),
            goto_options: GotoOptions {
                timeout: timeout.as_millis() as u64,
                wait_until: "networkidle2",
            },
        };

        let resp = self
            .client
            .post(self.endpoint.clone())
            .timeout(timeout + REQUEST_GRACE)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                408 => FetchError::Timeout(timeout.as_millis() as u64),
                429 | 500..=599 => FetchError::Network(format!(
                    "Browserless error (status {status}): {message}"
                )),
                _ => FetchError::Render(format!("Browserless error (status {status}): {message}")),
            });
        }

        let page_status = resp
            .headers()
            .get("x-response-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(200);

        let content = resp.text().await?;
        debug!(session = self.id, status = page_status, bytes = content.len(), "Page rendered");

        Ok(RenderedPage {
            content,
            status: page_status,
        })
    }
}
