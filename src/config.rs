//! Configuration module for the log shipper.
//!
//! Configuration can be built in code with [`ShipperConfig::new`] or loaded
//! from `SLS_*` environment variables with [`ShipperConfig::from_env`]. Both
//! paths go through [`ShipperConfig::validate`], which the shipper also runs
//! at construction so a bad configuration fails fast.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::encoder::{Compression, WireFormat};
use crate::event::{FieldValue, Fields};

/// Default log topic.
pub const DEFAULT_TOPIC: &str = "loglayer";

/// Default log source.
pub const DEFAULT_SOURCE: &str = "nodejs";

/// Default batch size (number of records per batch)
const DEFAULT_BATCH_SIZE: usize = 100;

/// Allowed batch size range
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 1_000;

/// Default flush interval in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Allowed flush interval range in milliseconds
const MIN_FLUSH_INTERVAL_MS: u64 = 1_000;
const MAX_FLUSH_INTERVAL_MS: u64 = 300_000;

/// Default and maximum number of retries per batch
const DEFAULT_MAX_RETRIES: u32 = 3;
const MAX_RETRIES_LIMIT: u32 = 10;

const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Maximum number of records held before the oldest are dropped.
const DEFAULT_MAX_BUFFER_SIZE: usize = 10_000;

const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_APP_VERSION: &str = "unknown";

/// Error raised when the configuration is missing or out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Configuration error for {field}: {message}")]
pub struct ConfigError {
    /// Option (or environment variable) that failed validation
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Toggles controlling which system fields are attached to each record.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Tag each batch with a PackID
    pub enable_pack_id: bool,
    pub include_environment: bool,
    pub include_version: bool,
    pub include_host_ip: bool,
    pub include_category: bool,
    pub include_logger: bool,
    /// Attach trace/span ids to records
    pub include_trace: bool,

    pub environment: String,
    pub app_version: String,
    pub logger_name: String,

    /// Static fields added to every record
    pub custom_fields: Fields,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enable_pack_id: true,
            include_environment: true,
            include_version: true,
            include_host_ip: false,
            include_category: true,
            include_logger: false,
            include_trace: true,
            environment: env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string()),
            app_version: env::var("APP_VERSION")
                .unwrap_or_else(|_| DEFAULT_APP_VERSION.to_string()),
            logger_name: DEFAULT_TOPIC.to_string(),
            custom_fields: Fields::new(),
        }
    }
}

impl EnrichmentConfig {
    /// Add a static field to every shipped record.
    pub fn with_custom_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.custom_fields.insert(key, value);
        self
    }
}

/// Configuration for the log shipper.
///
/// Environment variables read by [`ShipperConfig::from_env`]:
/// - `SLS_ENDPOINT`, `SLS_ACCESS_KEY_ID`, `SLS_ACCESS_KEY_SECRET`,
///   `SLS_PROJECT`, `SLS_LOGSTORE` (required)
/// - `SLS_TOPIC` (default: loglayer), `SLS_SOURCE` (default: nodejs)
/// - `SLS_BATCH_SIZE` (default: 100, 1-1000)
/// - `SLS_FLUSH_INTERVAL_MS` (default: 5000, 1000-300000)
/// - `SLS_MAX_RETRIES` (default: 3, 0-10)
/// - `SLS_RETRY_BASE_DELAY_MS` (default: 1000)
/// - `SLS_REQUEST_TIMEOUT_MS` (default: 10000)
/// - `SLS_WIRE_FORMAT` (json | protobuf), `SLS_COMPRESSION` (none | deflate)
#[derive(Clone)]
pub struct ShipperConfig {
    /// Service endpoint, either a bare region host or a full URL
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub project: String,
    pub logstore: String,

    pub topic: String,
    pub source: String,

    /// Number of records to accumulate before flushing immediately
    pub batch_size: usize,

    /// Interval of the background flush timer
    pub flush_interval: Duration,

    /// Re-attempts after the first failed delivery of a batch
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,

    /// Upper bound of the pending queue
    pub max_buffer_size: usize,

    pub wire_format: WireFormat,
    pub compression: Compression,

    pub enrichment: EnrichmentConfig,
}

impl std::fmt::Debug for ShipperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShipperConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("project", &self.project)
            .field("logstore", &self.logstore)
            .field("topic", &self.topic)
            .field("source", &self.source)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("request_timeout", &self.request_timeout)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("wire_format", &self.wire_format)
            .field("compression", &self.compression)
            .field("enrichment", &self.enrichment)
            .finish()
    }
}

impl ShipperConfig {
    /// Create a configuration with the required options and defaults for the rest.
    pub fn new(
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        project: impl Into<String>,
        logstore: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            project: project.into(),
            logstore: logstore.into(),
            topic: DEFAULT_TOPIC.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            wire_format: WireFormat::default(),
            compression: Compression::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing, an optional
    /// one cannot be parsed, or the resulting configuration fails
    /// [`validate`](Self::validate).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sls_log_shipper::config::ShipperConfig;
    ///
    /// let config = ShipperConfig::from_env().expect("Failed to load config");
    /// println!("Shipping to: {}", config.ingest_url());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            required_env("SLS_ENDPOINT")?,
            required_env("SLS_ACCESS_KEY_ID")?,
            required_env("SLS_ACCESS_KEY_SECRET")?,
            required_env("SLS_PROJECT")?,
            required_env("SLS_LOGSTORE")?,
        );

        if let Ok(topic) = env::var("SLS_TOPIC") {
            config.topic = topic;
        }
        if let Ok(source) = env::var("SLS_SOURCE") {
            config.source = source;
        }
        if let Some(batch_size) = parse_env::<usize>("SLS_BATCH_SIZE")? {
            config.batch_size = batch_size;
        }
        if let Some(ms) = parse_env::<u64>("SLS_FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_env::<u32>("SLS_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(ms) = parse_env::<u64>("SLS_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("SLS_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(format) = parse_env::<WireFormat>("SLS_WIRE_FORMAT")? {
            config.wire_format = format;
        }
        if let Some(compression) = parse_env::<Compression>("SLS_COMPRESSION")? {
            config.compression = compression;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_enrichment(mut self, enrichment: EnrichmentConfig) -> Self {
        self.enrichment = enrichment;
        self
    }

    /// Check required options and numeric ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("endpoint", &self.endpoint),
            ("accessKeyId", &self.access_key_id),
            ("accessKeySecret", &self.access_key_secret),
            ("project", &self.project),
            ("logstore", &self.logstore),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::new(field, "is required"));
            }
        }

        if self.has_scheme() {
            let url = Url::parse(&self.endpoint)
                .map_err(|e| ConfigError::new("endpoint", format!("invalid URL: {}", e)))?;
            if url.host_str().is_none() {
                return Err(ConfigError::new("endpoint", "URL has no host"));
            }
        }

        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::new(
                "batchSize",
                format!(
                    "{} is outside the allowed range ({}-{})",
                    self.batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
                ),
            ));
        }

        let interval_ms = self.flush_interval.as_millis();
        if interval_ms < MIN_FLUSH_INTERVAL_MS as u128
            || interval_ms > MAX_FLUSH_INTERVAL_MS as u128
        {
            return Err(ConfigError::new(
                "flushInterval",
                format!(
                    "{}ms is outside the allowed range ({}-{}ms)",
                    interval_ms, MIN_FLUSH_INTERVAL_MS, MAX_FLUSH_INTERVAL_MS
                ),
            ));
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::new(
                "maxRetries",
                format!("{} exceeds maximum allowed ({})", self.max_retries, MAX_RETRIES_LIMIT),
            ));
        }

        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::new(
                "retryMaxDelay",
                "must not be shorter than retryBaseDelay",
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::new("requestTimeout", "must be greater than 0"));
        }

        if self.max_buffer_size < self.batch_size {
            return Err(ConfigError::new(
                "maxBufferSize",
                format!("{} is smaller than batchSize {}", self.max_buffer_size, self.batch_size),
            ));
        }

        Ok(())
    }

    fn has_scheme(&self) -> bool {
        self.endpoint.contains("://")
    }

    /// Path of the PutLogs resource, also the signed resource.
    pub fn resource_path(&self) -> String {
        format!("/logstores/{}/shards/lb", self.logstore)
    }

    /// Full URL of the PutLogs call.
    pub fn ingest_url(&self) -> String {
        if self.has_scheme() {
            format!("{}{}", self.endpoint.trim_end_matches('/'), self.resource_path())
        } else {
            format!("https://{}{}", self.host(), self.resource_path())
        }
    }

    /// Value of the `Host` header.
    pub fn host(&self) -> String {
        if self.has_scheme() {
            match Url::parse(&self.endpoint) {
                Ok(url) => match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    _ => self.endpoint.clone(),
                },
                Err(_) => self.endpoint.clone(),
            }
        } else {
            format!("{}.{}", self.project, self.endpoint.trim_end_matches('/'))
        }
    }
}

fn required_env(var: &str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::new(var, "is required")),
    }
}

fn parse_env<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::new(var, format!("'{}' is not a valid value", value))),
        Err(_) => Ok(None),
    }
}
