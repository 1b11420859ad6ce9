//! Harvest Fetch - Page acquisition and text extraction
//!
//! The Fetcher drives a browser-automation backend through a bounded pool
//! of sessions and returns rendered page content. The Extractor turns that
//! content into a clean, hashed `Document`.
//!
//! Backends:
//! - Browserless (`/content` endpoint, headless Chrome)
//! - Static HTTP (plain GET, no script execution)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{Classify, ErrorClass};
use thiserror::Error;
use url::Url;

pub mod browserless;
pub mod extract;
pub mod fetcher;
pub mod http;
pub mod pool;

pub use browserless::BrowserlessBackend;
pub use extract::{ExtractError, Extractor};
pub use fetcher::Fetcher;
pub use http::StaticHttpBackend;
pub use pool::{PooledSession, SessionPool};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while fetching a page
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The URL could not be parsed or uses an unsupported scheme
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The page did not become ready within the timeout
    #[error("Timed out after {0}ms waiting for page")]
    Timeout(u64),

    /// Transport failure talking to the backend or the target site
    #[error("Network error: {0}")]
    Network(String),

    /// The target refused access
    #[error("Blocked or forbidden (status {status})")]
    BlockedOrForbidden { status: u16 },

    /// The browser failed to render the page
    #[error("Render error: {0}")]
    Render(String),

    /// The target answered with a non-success status that is not a block
    #[error("Unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    /// No browser session could be opened
    #[error("Browser session unavailable: {0}")]
    SessionUnavailable(String),

    /// The session pool was shut down
    #[error("Session pool closed")]
    PoolClosed,
}

impl Classify for FetchError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::SessionUnavailable(_) => {
                ErrorClass::TransientIO
            }
            Self::InvalidUrl { .. } | Self::BlockedOrForbidden { .. } | Self::HttpStatus { .. } => {
                ErrorClass::InputError
            }
            Self::Render(_) => ErrorClass::ToolingError,
            Self::PoolClosed => ErrorClass::Fatal,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(0)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

// ============================================================================
// Page Types
// ============================================================================

/// Content as returned by a browser session
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Page content after script execution
    pub content: String,

    /// Status code of the target page
    pub status: u16,
}

/// A successfully fetched page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub content: String,
    pub status: u16,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Wrap content that did not come through a browser
    pub fn raw(locator: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: locator.into(),
            content: content.into(),
            status: 200,
            fetched_at: Utc::now(),
        }
    }
}

// ============================================================================
// Backend Traits
// ============================================================================

/// A browser-automation service able to open rendering sessions
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Open a new session
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, FetchError>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// One browser session; used by a single fetch at a time
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate to `url` and return the rendered content
    async fn render(&mut self, url: &Url, timeout: Duration) -> Result<RenderedPage, FetchError>;
}
