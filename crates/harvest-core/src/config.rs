//! Harvest Configuration Management
//!
//! Handles configuration from environment variables and TOML files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Browser backend and session pool
    pub fetcher: FetcherConfig,

    /// Text extraction
    pub extractor: ExtractorConfig,

    /// NLP annotation
    pub annotator: AnnotatorConfig,

    /// Entity resolution
    pub resolver: ResolverConfig,

    /// Graph store connection
    pub graph: GraphConfig,

    /// Worker pools, queues and retry
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Fetcher
        if let Ok(backend) = std::env::var("HARVEST_FETCH_BACKEND") {
            config.fetcher.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("BROWSERLESS_URL") {
            config.fetcher.browserless_url = url;
        }
        if let Ok(token) = std::env::var("BROWSERLESS_TOKEN") {
            config.fetcher.browserless_token = Some(token);
        }
        if let Some(size) = parse_env::<usize>("HARVEST_SESSION_POOL_SIZE")? {
            config.fetcher.pool_size = size;
        }
        if let Some(secs) = parse_env::<u64>("HARVEST_FETCH_TIMEOUT_SECS")? {
            config.fetcher.timeout_secs = secs;
        }

        // Annotator
        if let Ok(backend) = std::env::var("HARVEST_ANNOTATOR") {
            config.annotator.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("CORENLP_URL") {
            config.annotator.corenlp_url = url;
        }

        // SurrealDB
        if let Ok(backend) = std::env::var("HARVEST_GRAPH_BACKEND") {
            config.graph.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            config.graph.surrealdb_url = url;
        }
        if let Ok(user) = std::env::var("SURREALDB_USER") {
            config.graph.surrealdb_user = user;
        }
        if let Ok(pass) = std::env::var("SURREALDB_PASS") {
            config.graph.surrealdb_pass = pass;
        }

        // Worker pools
        if let Some(n) = parse_env::<usize>("HARVEST_FETCH_WORKERS")? {
            config.pipeline.fetch_workers = n;
        }
        if let Some(n) = parse_env::<usize>("HARVEST_ANNOTATE_WORKERS")? {
            config.pipeline.annotate_workers = n;
        }
        if let Some(n) = parse_env::<usize>("HARVEST_WRITE_WORKERS")? {
            config.pipeline.write_workers = n;
        }
        if let Some(n) = parse_env::<usize>("HARVEST_QUEUE_CAPACITY")? {
            config.pipeline.queue_capacity = n;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_env::<bool>("LOG_JSON")? {
            config.logging.json_format = json;
        }

        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        Ok(self.overlay(Self::from_env()?))
    }

    /// Take every value of `env` that differs from its default
    fn overlay(mut self, env: Self) -> Self {
        let defaults = Self::default();

        macro_rules! take {
            ($($section:ident . $field:ident),+ $(,)?) => {
                $(
                    if env.$section.$field != defaults.$section.$field {
                        self.$section.$field = env.$section.$field;
                    }
                )+
            };
        }

        take!(
            fetcher.backend,
            fetcher.browserless_url,
            fetcher.pool_size,
            fetcher.timeout_secs,
            annotator.backend,
            annotator.corenlp_url,
            graph.backend,
            graph.surrealdb_url,
            pipeline.fetch_workers,
            pipeline.annotate_workers,
            pipeline.write_workers,
            pipeline.queue_capacity,
            logging.level,
            logging.json_format,
        );

        // Always use env for sensitive values
        if env.fetcher.browserless_token.is_some() {
            self.fetcher.browserless_token = env.fetcher.browserless_token;
        }
        take!(graph.surrealdb_user, graph.surrealdb_pass);

        self
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("fetcher.pool_size", self.fetcher.pool_size),
            ("pipeline.fetch_workers", self.pipeline.fetch_workers),
            ("pipeline.annotate_workers", self.pipeline.annotate_workers),
            ("pipeline.write_workers", self.pipeline.write_workers),
            ("pipeline.queue_capacity", self.pipeline.queue_capacity),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let timeouts = [
            ("fetcher.timeout_secs", self.fetcher.timeout_secs),
            ("annotator.budget_ms", self.annotator.budget_ms),
            ("graph.request_timeout_secs", self.graph.request_timeout_secs),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let thresholds = [
            (
                "resolver.similarity_threshold",
                self.resolver.similarity_threshold,
            ),
            ("annotator.min_confidence", f64::from(self.annotator.min_confidence)),
        ];
        for (key, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Browser backend used by the Fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherBackendKind {
    /// Headless Chrome behind a Browserless endpoint
    Browserless,
    /// Plain HTTP GET, no script execution
    Http,
}

impl std::str::FromStr for FetcherBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "browserless" => Ok(Self::Browserless),
            "http" | "static" => Ok(Self::Http),
            _ => Err(ConfigError::InvalidValue {
                key: "HARVEST_FETCH_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub backend: FetcherBackendKind,

    /// Browserless base URL
    pub browserless_url: String,

    /// Browserless API token
    pub browserless_token: Option<String>,

    /// Maximum number of browser sessions alive at once
    pub pool_size: usize,

    /// Wall-clock bound on page readiness, in seconds
    pub timeout_secs: u64,

    /// User agent sent by the static HTTP backend
    pub user_agent: String,
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            backend: FetcherBackendKind::Browserless,
            browserless_url: "http://localhost:3000".to_string(),
            browserless_token: None,
            pool_size: 4,
            timeout_secs: 30,
            user_agent: concat!("harvest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Extractor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Documents with less text than this (in characters) are dropped
    pub min_text_length: usize,

    /// Column width handed to the HTML renderer
    pub render_width: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_text_length: 40,
            render_width: 10_000,
        }
    }
}

/// NLP backend used by the Annotator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotatorBackendKind {
    /// Built-in regex and gazetteer rules
    Rules,
    /// Stanford CoreNLP server
    CoreNlp,
}

impl std::str::FromStr for AnnotatorBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rules" | "rule" => Ok(Self::Rules),
            "corenlp" => Ok(Self::CoreNlp),
            _ => Err(ConfigError::InvalidValue {
                key: "HARVEST_ANNOTATOR".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Gazetteer entry for the rule-based annotator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GazetteerEntry {
    pub term: String,
    /// Annotator label, e.g. `ORGANIZATION`
    pub entity_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Annotator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    pub backend: AnnotatorBackendKind,

    /// CoreNLP server URL
    pub corenlp_url: String,

    /// Per-document processing budget in milliseconds
    pub budget_ms: u64,

    /// Mentions below this confidence are discarded
    pub min_confidence: f32,

    /// Extra gazetteer terms for the rule-based backend
    pub gazetteer: Vec<GazetteerEntry>,
}

impl AnnotatorConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            backend: AnnotatorBackendKind::Rules,
            corenlp_url: "http://localhost:9000".to_string(),
            budget_ms: 20_000,
            min_confidence: 0.5,
            gazetteer: Vec::new(),
        }
    }
}

/// Entity resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum alias similarity (0.0 - 1.0) for near-duplicate merging
    pub similarity_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
        }
    }
}

/// Graph store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphBackendKind {
    SurrealDb,
    Memory,
}

impl std::str::FromStr for GraphBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "surrealdb" | "surreal" => Ok(Self::SurrealDb),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::InvalidValue {
                key: "HARVEST_GRAPH_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Graph store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub backend: GraphBackendKind,

    /// SurrealDB WebSocket URL
    pub surrealdb_url: String,

    /// SurrealDB username
    pub surrealdb_user: String,

    /// SurrealDB password
    pub surrealdb_pass: String,

    /// SurrealDB namespace
    pub surrealdb_namespace: String,

    /// SurrealDB database name
    pub surrealdb_database: String,

    /// Per-call deadline for store requests
    pub request_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: GraphBackendKind::SurrealDb,
            surrealdb_url: "ws://localhost:8000".to_string(),
            surrealdb_user: "root".to_string(),
            surrealdb_pass: "root".to_string(),
            surrealdb_namespace: "harvest".to_string(),
            surrealdb_database: "knowledge".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl GraphConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry settings for one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each subsequent one
    pub base_delay_ms: u64,

    /// Upper bound on the exponential delay
    pub max_delay_ms: u64,

    /// Random extra delay added to each wait
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_ms: 100,
        }
    }
}

/// Worker pools, queues and per-stage retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent fetches (network-bound)
    pub fetch_workers: usize,

    /// Concurrent annotations (CPU-bound)
    pub annotate_workers: usize,

    /// Concurrent store writes (store-bound)
    pub write_workers: usize,

    /// Capacity of every inter-stage queue
    pub queue_capacity: usize,

    pub fetch_retry: RetryConfig,

    pub annotate_retry: RetryConfig,

    pub write_retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 4,
            annotate_workers: 2,
            write_workers: 4,
            queue_capacity: 32,
            fetch_retry: RetryConfig::default(),
            annotate_retry: RetryConfig {
                max_retries: 1,
                ..RetryConfig::default()
            },
            write_retry: RetryConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
