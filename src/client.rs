//! HTTP delivery of record batches to the log service.
//!
//! [`DeliveryClient`] encodes a batch once, then signs and posts it, retrying
//! transient failures with capped exponential backoff. Every outcome is
//! folded into the shared [`TransportStats`]; nothing is returned as an error
//! to the code that submitted the records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::buffer::Batch;
use crate::config::{ConfigError, ShipperConfig};
use crate::encoder::{EncodeError, EncodedBody, WireEncoder};
use crate::signer::RequestSigner;
use crate::stats::TransportStats;

/// Substrings of transport errors that indicate a transient network problem.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "temporary failure in name resolution",
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "eai_again",
];

/// Errors from a single delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    /// Service answered with a non-2xx status
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] EncodeError),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Request(err)
        }
    }
}

impl DeliveryError {
    /// Whether the failure is transient and worth another attempt.
    ///
    /// Timeouts, connection and DNS failures and 5xx responses are retriable.
    /// 4xx responses (including signature rejections) and encoding failures
    /// are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            DeliveryError::Timeout => true,
            DeliveryError::Request(e) => {
                e.is_timeout() || e.is_connect() || matches_transient_pattern(e)
            }
            DeliveryError::Status { code, .. } => code.is_server_error(),
            DeliveryError::Encode(_) => false,
        }
    }
}

fn matches_transient_pattern(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if TRANSIENT_PATTERNS.iter().any(|p| text.contains(p)) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-attempt number `retry + 1`:
    /// `min(base_delay * 2^retry, max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Final result of delivering one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The service accepted the batch
    Delivered { attempts: u32 },

    /// The batch was dropped after a terminal error or exhausted retries
    Dropped {
        attempts: u32,
        retriable: bool,
        error: String,
    },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Dropped { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Authenticated PutLogs client.
///
/// The underlying reqwest client is reused across batches for connection
/// pooling and applies the configured timeout to every request.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: Client,
    url: String,
    host: String,
    resource: String,
    signer: RequestSigner,
    encoder: WireEncoder,
    retry: RetryPolicy,
    timeout: Duration,
    stats: Arc<TransportStats>,
}

impl DeliveryClient {
    /// Create a delivery client reporting into `stats`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the signer or HTTP client cannot be built.
    pub fn new(config: &ShipperConfig, stats: Arc<TransportStats>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConfigError {
                field: "httpClient".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: config.ingest_url(),
            host: config.host(),
            resource: config.resource_path(),
            signer: RequestSigner::new(&config.access_key_id, &config.access_key_secret)?,
            encoder: WireEncoder::new(
                config.wire_format,
                config.compression,
                &config.topic,
                &config.source,
            ),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
            timeout: config.request_timeout,
            stats,
        })
    }

    /// Deliver a batch, retrying transient failures.
    ///
    /// Never fails: a batch that cannot be delivered is dropped with a single
    /// error line and counted in the stats.
    pub async fn deliver(&self, batch: Batch) -> DeliveryOutcome {
        let records = batch.len();

        let body = match self.encoder.encode(&batch.records, batch.pack_id.as_deref()) {
            Ok(body) => body,
            Err(e) => {
                let e = DeliveryError::from(e);
                return self.drop_batch(&batch, 0, &e);
            }
        };

        debug!(
            batch_id = %batch.id,
            pack_id = ?batch.pack_id,
            records = records,
            bytes = body.body.len(),
            url = %self.url,
            "Sending log batch"
        );

        let mut retry = 0;
        loop {
            let attempts = retry + 1;
            match self.send_once(&body).await {
                Ok(()) => {
                    self.stats.record_success(records);
                    info!(
                        batch_id = %batch.id,
                        records = records,
                        attempts = attempts,
                        "Delivered log batch"
                    );
                    return DeliveryOutcome::Delivered { attempts };
                }
                Err(e) if e.is_retriable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry);
                    debug!(
                        batch_id = %batch.id,
                        error = %e,
                        attempt = attempts,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Delivery failed, will retry"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return self.drop_batch(&batch, attempts, &e),
            }
        }
    }

    fn drop_batch(&self, batch: &Batch, attempts: u32, err: &DeliveryError) -> DeliveryOutcome {
        let retriable = err.is_retriable();
        self.stats.record_failure();
        error!(
            batch_id = %batch.id,
            pack_id = ?batch.pack_id,
            records = batch.len(),
            attempts = attempts,
            retriable = retriable,
            error = %err,
            "Dropping log batch"
        );
        DeliveryOutcome::Dropped {
            attempts,
            retriable,
            error: err.to_string(),
        }
    }

    /// Sign and post an encoded body once.
    async fn send_once(&self, body: &EncodedBody) -> Result<(), DeliveryError> {
        let mut headers = self.encoder.transport_headers(body, &self.host, Utc::now());
        let authorization = self.signer.authorization("POST", &self.resource, &headers);
        headers.insert("Authorization".to_string(), authorization);

        let mut request = self.client.post(&self.url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.body(body.body.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(DeliveryError::Status {
            code: status,
            message,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
