//! sls-ship - Ship log lines from stdin to an SLS compatible log service
//!
//! Every line read from stdin becomes one log record. A line that parses as a
//! JSON object is shipped with its `level`, `message` and remaining keys as
//! structured fields; anything else is shipped verbatim at `info` level.
//!
//! The shipper is shut down, flushing what is queued, on EOF or Ctrl+C.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `SLS_ENDPOINT`, `SLS_ACCESS_KEY_ID`, `SLS_ACCESS_KEY_SECRET`,
//!   `SLS_PROJECT`, `SLS_LOGSTORE`: required
//! - `SLS_BATCH_SIZE`: Records per batch (default: 100)
//! - `SLS_FLUSH_INTERVAL_MS`: Milliseconds between time-based flushes (default: 5000)
//! - `SLS_MAX_RETRIES`: Retries per batch (default: 3)
//! - `SLS_WIRE_FORMAT`: `json` or `protobuf` (default: json)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sls_log_shipper::{FieldValue, Fields, LogEvent, LogLevel, LogShipper, ShipperConfig};

/// Upper bound on the final flush during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match ShipperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let shipper = match LogShipper::new(config) {
        Ok(shipper) => shipper,
        Err(e) => {
            error!(error = %e, "Failed to create log shipper");
            std::process::exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shipped: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line) {
                        shipper.submit(event);
                        shipped += 1;
                    }
                }
                Ok(None) => {
                    info!("End of input reached");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from stdin");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown signal received, stopping..."),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    info!(lines = shipped, "Initiating graceful shutdown...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shipper.shutdown())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    let stats = shipper.stats();
    info!(
        total_sent = stats.total_sent,
        failures = stats.failure_count,
        "sls-ship stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Diagnostics go to stderr so they never mix with piped input.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Turn one input line into an event. Blank lines are skipped.
fn parse_line(line: &str) -> Option<LogEvent> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(line) else {
        return Some(LogEvent::new(LogLevel::Info, line));
    };

    let level = map
        .get("level")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogLevel::Info);
    let message = match map.get("message").or_else(|| map.get("msg")) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let fields = map
        .into_iter()
        .filter(|(key, _)| !matches!(key.as_str(), "level" | "message" | "msg"))
        .map(|(key, value)| (key, json_to_field(value)))
        .collect::<Fields>();

    Some(LogEvent::new(level, message).with_fields(fields))
}

fn json_to_field(value: serde_json::Value) -> FieldValue {
    use serde_json::Value;
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FieldValue::String(s),
        // Arrays have no field variant; keep them as JSON text
        Value::Array(_) => FieldValue::String(value.to_string()),
        Value::Object(map) => FieldValue::Map(
            map.into_iter()
                .map(|(key, value)| (key, json_to_field(value)))
                .collect(),
        ),
    }
}
