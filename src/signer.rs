//! Request signing for the log service's `LOG` authorization scheme.
//!
//! The canonical string layout is fixed by the service and must match it
//! byte for byte:
//!
//! ```text
//! METHOD\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! name:value\n   (each x-log-* / x-acs-* header, lowercased, sorted)
//! /resource
//! ```
//!
//! The string is signed with HMAC-SHA1 and the digest is base64 encoded.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::config::ConfigError;

type HmacSha1 = Hmac<Sha1>;

/// Header name prefixes included in the canonical header block.
pub const SIGNED_HEADER_PREFIXES: [&str; 2] = ["x-log-", "x-acs-"];

/// Authorization scheme name.
pub const AUTH_SCHEME: &str = "LOG";

/// Signs requests with an access key pair.
#[derive(Clone)]
pub struct RequestSigner {
    access_key_id: String,
    mac: HmacSha1,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: &str,
    ) -> Result<Self, ConfigError> {
        let mac = HmacSha1::new_from_slice(access_key_secret.as_bytes()).map_err(|e| ConfigError {
            field: "accessKeySecret".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            access_key_id: access_key_id.into(),
            mac,
        })
    }

    /// Compute the base64 HMAC-SHA1 signature of a request.
    pub fn sign(&self, method: &str, resource: &str, headers: &BTreeMap<String, String>) -> String {
        let canonical = canonical_string(method, resource, headers);
        let mut mac = self.mac.clone();
        mac.update(canonical.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Value of the `Authorization` header for a request.
    pub fn authorization(
        &self,
        method: &str,
        resource: &str,
        headers: &BTreeMap<String, String>,
    ) -> String {
        format!(
            "{} {}:{}",
            AUTH_SCHEME,
            self.access_key_id,
            self.sign(method, resource, headers)
        )
    }
}

/// Build the string that gets signed.
///
/// Header names are matched case-insensitively using ASCII folding only.
pub fn canonical_string(
    method: &str,
    resource: &str,
    headers: &BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(&method.to_ascii_uppercase());
    out.push('\n');
    out.push_str(header_value(headers, "content-md5"));
    out.push('\n');
    out.push_str(header_value(headers, "content-type"));
    out.push('\n');
    out.push_str(header_value(headers, "date"));
    out.push('\n');
    out.push_str(&canonical_headers(headers));
    out.push_str(resource);
    out
}

fn header_value<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> &'a str {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
        .unwrap_or("")
}

/// The vendor header block: `name:value\n` per header, sorted by name.
pub fn canonical_headers(headers: &BTreeMap<String, String>) -> String {
    let mut signed: Vec<(String, &str)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .filter(|(k, _)| SIGNED_HEADER_PREFIXES.iter().any(|p| k.starts_with(p)))
        .collect();
    signed.sort_by(|a, b| a.0.cmp(&b.0));

    signed
        .into_iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect()
}
