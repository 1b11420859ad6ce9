//! Static HTTP backend
//!
//! Fetches pages with a plain GET. No script runs, so this only suits
//! server-rendered pages; sessions are cheap handles on a shared client.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{BrowserBackend, BrowserSession, FetchError, RenderedPage};

pub struct StaticHttpBackend {
    client: reqwest::Client,
}

impl StaticHttpBackend {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::SessionUnavailable(format!("HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl BrowserBackend for StaticHttpBackend {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, FetchError> {
        Ok(Box::new(StaticHttpSession {
            client: self.client.clone(),
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

struct StaticHttpSession {
    client: reqwest::Client,
}

#[async_trait]
impl BrowserSession for StaticHttpSession {
    async fn render(&mut self, url: &Url, timeout: Duration) -> Result<RenderedPage, FetchError> {
        let resp = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| match FetchError::from(e) {
                FetchError::Timeout(_) => FetchError::Timeout(timeout.as_millis() as u64),
                other => other,
            })?;

        let status = resp.status().as_u16();
        let content = resp.text().await?;

        Ok(RenderedPage { content, status })
    }
}
