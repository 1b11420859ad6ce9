//! Fetcher
//!
//! Retrieves rendered page content through the session pool, classifying
//! failures and retrying the transient ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_core::{FetcherBackendKind, FetcherConfig, RetryFailure, RetryPolicy};
use tokio::time::Instant;
use tracing::{debug, instrument};
use url::Url;

use crate::{
    BrowserBackend, BrowserlessBackend, FetchError, FetchedPage, RenderedPage, SessionPool,
    StaticHttpBackend,
};

/// Page fetcher backed by a pool of browser sessions
pub struct Fetcher {
    pool: SessionPool,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(
        backend: Arc<dyn BrowserBackend>,
        pool_size: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            pool: SessionPool::new(backend, pool_size),
            retry,
            timeout,
        }
    }

    /// Create from config
    pub fn from_config(config: &FetcherConfig, retry: RetryPolicy) -> Result<Self, FetchError> {
        let backend: Arc<dyn BrowserBackend> = match config.backend {
            FetcherBackendKind::Browserless => Arc::new(BrowserlessBackend::new(
                &config.browserless_url,
                config.browserless_token.as_deref(),
            )?),
            FetcherBackendKind::Http => Arc::new(StaticHttpBackend::new(&config.user_agent)?),
        };

        Ok(Self::new(backend, config.pool_size, retry, config.timeout()))
    }

    /// Default page-readiness timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Check that at least one browser session can be opened
    pub async fn warm_up(&self) -> Result<(), FetchError> {
        let session = tokio::time::timeout(self.timeout, self.pool.acquire())
            .await
            .map_err(|_| {
                FetchError::SessionUnavailable(format!(
                    "no session opened within {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        drop(session);
        debug!(backend = self.pool.backend_name(), "Browser backend reachable");
        Ok(())
    }

    /// Fetch `url`, waiting at most `timeout` for page readiness per attempt.
    ///
    /// `Timeout` and `Network` failures are retried according to the retry
    /// policy; everything else surfaces after the first attempt. An invalid
    /// URL is reported without any attempt being made.
    #[instrument(skip(self), fields(backend = self.pool.backend_name()))]
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedPage, RetryFailure<FetchError>> {
        let parsed = parse_url(url).map_err(|error| RetryFailure {
            error,
            attempts: 0,
            exhausted: false,
        })?;

        self.retry
            .retry("fetch", || self.attempt(&parsed, timeout))
            .await
    }

    /// One attempt; acquiring the session and rendering share one deadline
    async fn attempt(&self, url: &Url, timeout: Duration) -> Result<FetchedPage, FetchError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || FetchError::Timeout(timeout.as_millis() as u64);

        let mut session = match tokio::time::timeout_at(deadline, self.pool.acquire()).await {
            Ok(session) => session?,
            Err(_) => return Err(timed_out()),
        };

        let result = match tokio::time::timeout_at(deadline, session.render(url, timeout)).await {
            Ok(Ok(page)) => classify_status(page),
            Ok(Err(FetchError::Timeout(_))) | Err(_) => Err(timed_out()),
            Ok(Err(e)) => Err(e),
        };

        // A session that hung or broke is not trusted with the next fetch
        if matches!(
            result,
            Err(FetchError::Timeout(_) | FetchError::Network(_) | FetchError::Render(_))
        ) {
            session.discard();
        }

        result.map(|page| FetchedPage {
            url: url.to_string(),
            content: page.content,
            status: page.status,
            fetched_at: Utc::now(),
        })
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Map the target page's status code onto the fetch error taxonomy
fn classify_status(page: RenderedPage) -> Result<RenderedPage, FetchError> {
    match page.status {
        200..=399 => Ok(page),
        401 | 403 | 407 | 429 | 451 => Err(FetchError::BlockedOrForbidden {
            status: page.status,
        }),
        408 | 500..=599 => Err(FetchError::Network(format!(
            "target answered with status {}",
            page.status
        ))),
        status => Err(FetchError::HttpStatus { status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrowserSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend whose sessions answer from a script, one entry per render
    struct ScriptedBackend {
        script: Arc<Mutex<Vec<Result<RenderedPage, FetchError>>>>,
        renders: Arc<AtomicU32>,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn new(mut script: Vec<Result<RenderedPage, FetchError>>) -> Self {
            script.reverse();
            Self {
                script: Arc::new(Mutex::new(script)),
                renders: Arc::new(AtomicU32::new(0)),
                delay: None,
            }
        }

        fn hanging() -> Self {
            Self {
                delay: Some(Duration::from_secs(60)),
                ..Self::new(Vec::new())
            }
        }
    }

    struct ScriptedSession {
        script: Arc<Mutex<Vec<Result<RenderedPage, FetchError>>>>,
        renders: Arc<AtomicU32>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl BrowserBackend for ScriptedBackend {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>, FetchError> {
            Ok(Box::new(ScriptedSession {
                script: self.script.clone(),
                renders: self.renders.clone(),
                delay: self.delay,
            }))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn render(&mut self, _url: &Url, _timeout: Duration) -> Result<RenderedPage, FetchError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::Network("connection reset".into())))
        }
    }

    fn ok_page(content: &str) -> Result<RenderedPage, FetchError> {
        Ok(RenderedPage {
            content: content.to_string(),
            status: 200,
        })
    }

    fn fetcher(backend: ScriptedBackend, max_retries: u32) -> Fetcher {
        Fetcher::new(
            Arc::new(backend),
            2,
            RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let f = fetcher(ScriptedBackend::new(vec![ok_page("<p>hello</p>")]), 3);
        let page = f
            .fetch("https://example.com/a", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.content, "<p>hello</p>");
        assert_eq!(page.url, "https://example.com/a");
    }

    #[tokio::test]
    async fn test_network_error_attempted_max_retries_plus_one() {
        let backend = ScriptedBackend::new(Vec::new());
        let renders = backend.renders.clone();
        let f = fetcher(backend, 2);

        let failure = f
            .fetch("https://example.com", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(renders.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert!(matches!(failure.error, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Ok(RenderedPage {
            content: String::new(),
            status: 403,
        })]);
        let renders = backend.renders.clone();
        let f = fetcher(backend, 5);

        let failure = f
            .fetch("https://example.com", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(failure.error, FetchError::BlockedOrForbidden { status: 403 });
        assert!(!failure.exhausted);
    }

    #[tokio::test]
    async fn test_recovers_after_server_error() {
        let backend = ScriptedBackend::new(vec![
            Ok(RenderedPage {
                content: String::new(),
                status: 503,
            }),
            ok_page("recovered"),
        ]);
        let f = fetcher(backend, 2);

        let page = f
            .fetch("https://example.com", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(page.content, "recovered");
    }

    #[tokio::test]
    async fn test_hanging_page_times_out_and_releases_sessions() {
        let backend = ScriptedBackend::hanging();
        let renders = backend.renders.clone();
        let f = fetcher(backend, 1);

        let failure = f
            .fetch("https://example.com/slow", Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FetchError::Timeout(20)));
        assert_eq!(failure.attempts, 2);
        assert_eq!(renders.load(Ordering::SeqCst), 2);
        assert_eq!(f.pool().available(), 2);
        assert_eq!(f.pool().idle_count(), 0);
    }

    /// Backend that accepts the request for a session and never answers
    struct StalledBackend {
        opens: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BrowserBackend for StalledBackend {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>, FetchError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(FetchError::SessionUnavailable("never reached".into()))
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_session_open_times_out_and_is_retried() {
        let opens = Arc::new(AtomicU32::new(0));
        let f = Fetcher::new(
            Arc::new(StalledBackend {
                opens: opens.clone(),
            }),
            1,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_millis(20),
        );

        let failure = f
            .fetch("https://example.com/a", Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FetchError::Timeout(20)));
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert_eq!(f.pool().available(), 1);

        let warm_up = f.warm_up().await.unwrap_err();
        assert!(matches!(warm_up, FetchError::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_makes_no_attempt() {
        let backend = ScriptedBackend::new(Vec::new());
        let renders = backend.renders.clone();
        let f = fetcher(backend, 3);

        for url in ["not a url", "ftp://example.com/file"] {
            let failure = f.fetch(url, Duration::from_secs(1)).await.unwrap_err();
            assert_eq!(failure.attempts, 0);
            assert!(matches!(failure.error, FetchError::InvalidUrl { .. }));
        }
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_classify_status() {
        let page = |status| RenderedPage {
            content: String::new(),
            status,
        };
        assert!(classify_status(page(200)).is_ok());
        assert!(matches!(
            classify_status(page(451)),
            Err(FetchError::BlockedOrForbidden { status: 451 })
        ));
        assert!(matches!(classify_status(page(502)), Err(FetchError::Network(_))));
        for status in [408, 504] {
            match classify_status(page(status)) {
                Err(FetchError::Network(message)) => {
                    assert!(message.contains(&status.to_string()));
                }
                other => panic!("expected a transient network error, got {other:?}"),
            }
        }
        assert!(matches!(
            classify_status(page(404)),
            Err(FetchError::HttpStatus { status: 404 })
        ));
    }
}
