//! SLS Log Shipper Library
//!
//! Ships structured application logs to an Aliyun SLS compatible log service:
//!
//! - **event**: Log levels, structured fields and enriched records
//! - **config**: Shipper configuration, built in code or from `SLS_*` variables
//! - **enrich**: Host, process, environment and trace enrichment
//! - **buffer**: Bounded pending queue with size and time flush triggers
//! - **encoder**: JSON and protobuf LogGroup bodies plus transport headers
//! - **signer**: HMAC-SHA1 request signing
//! - **client**: HTTP delivery with exponential-backoff retries
//! - **pack_id**: Per-batch PackID correlation ids
//! - **trace**: W3C-style trace and span ids
//! - **stats**: Delivery counters
//! - **shipper**: The [`LogShipper`] tying it all together
//!
//! # Example
//!
//! ```no_run
//! use sls_log_shipper::{Fields, LogLevel, LogShipper, ShipperConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ShipperConfig::new(
//!         "cn-hangzhou.log.aliyuncs.com",
//!         "my-access-key-id",
//!         "my-access-key-secret",
//!         "my-project",
//!         "app-logs",
//!     );
//!     let shipper = LogShipper::new(config).expect("Failed to create shipper");
//!
//!     shipper.ship(
//!         LogLevel::Error,
//!         "payment failed",
//!         Fields::new().with("module", "billing").with("orderId", 1234),
//!     );
//!
//!     // Flush what is queued before exiting
//!     shipper.shutdown().await;
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod encoder;
pub mod enrich;
pub mod event;
pub mod pack_id;
pub mod shipper;
pub mod signer;
pub mod stats;
pub mod trace;

pub use buffer::{Batch, BufferStats, FlushTrigger};
pub use client::{DeliveryError, DeliveryOutcome, RetryPolicy};
pub use config::{ConfigError, EnrichmentConfig, ShipperConfig};
pub use encoder::{Compression, WireFormat};
pub use event::{EnrichedRecord, FieldValue, Fields, LogEvent, LogLevel};
pub use shipper::{LogShipper, ShipperError};
pub use stats::StatsSnapshot;
pub use trace::{TraceContext, TraceContextHolder};
