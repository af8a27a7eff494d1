//! Batch correlation ids ("PackID").
//!
//! A PackID has the form `PREFIX-SEQ`. The prefix is fixed for the lifetime
//! of a generator and the sequence is an uppercase hex counter bumped once per
//! flushed batch, so every line shipped together can be grouped again on the
//! service side.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::debug;

/// Length of the PackID prefix in hex characters.
pub const PREFIX_LEN: usize = 16;

/// Tag key the service reserves for the PackID.
pub const PACK_ID_TAG: &str = "__pack_id__";

/// Generator of `PREFIX-SEQ` batch ids.
#[derive(Debug)]
pub struct PackIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl PackIdGenerator {
    /// Create a generator whose prefix is derived from this host and process.
    pub fn new() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty());
        let prefix = derive_prefix(
            hostname.as_deref(),
            std::process::id(),
            Utc::now().timestamp_millis(),
        );
        debug!(prefix = %prefix, "PackID prefix derived");
        Self::with_prefix(prefix)
    }

    /// Create a generator with a fixed prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Bump the counter and render the next id.
    pub fn generate_next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:X}", self.prefix, seq)
    }
}

impl Default for PackIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the 16 character uppercase hex prefix.
///
/// Uses MD5 over `hostname-pid-start_ms`. Without a hostname the prefix falls
/// back to the hex timestamp followed by the hex pid.
pub fn derive_prefix(hostname: Option<&str>, pid: u32, start_ms: i64) -> String {
    match hostname {
        Some(host) => {
            let seed = format!("{}-{}-{}", host, pid, start_ms);
            let digest = format!("{:X}", md5::compute(seed.as_bytes()));
            digest[..PREFIX_LEN].to_string()
        }
        None => fallback_prefix(pid, start_ms),
    }
}

fn fallback_prefix(pid: u32, start_ms: i64) -> String {
    let raw = format!("{:X}{:X}", start_ms.max(0), pid);
    if raw.len() >= PREFIX_LEN {
        raw[raw.len() - PREFIX_LEN..].to_string()
    } else {
        format!("{:0>width$}", raw, width = PREFIX_LEN)
    }
}
