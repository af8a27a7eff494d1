//! Wire encoding of record batches.
//!
//! Produces the request body and the transport headers the service checks
//! before it verifies the signature. The body is serialized to bytes exactly
//! once; the same bytes are hashed for `Content-MD5` and sent, so the hash
//! always covers what goes on the wire.
//!
//! Two body formats are supported:
//! - [`WireFormat::Json`]: the JSON `__logs__` compatibility body
//! - [`WireFormat::Protobuf`]: the service's `LogGroup` message

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flate2::write::ZlibEncoder;
use prost::Message;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::event::EnrichedRecord;
use crate::pack_id::PACK_ID_TAG;

/// API version announced in `x-log-apiversion`.
pub const API_VERSION: &str = "0.6.0";

/// Signature method announced in `x-log-signaturemethod`.
pub const SIGNATURE_METHOD: &str = "hmac-sha1";

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_MD5: &str = "Content-MD5";
pub const HEADER_DATE: &str = "Date";
pub const HEADER_HOST: &str = "Host";
pub const HEADER_API_VERSION: &str = "x-log-apiversion";
pub const HEADER_BODY_RAW_SIZE: &str = "x-log-bodyrawsize";
pub const HEADER_COMPRESS_TYPE: &str = "x-log-compresstype";
pub const HEADER_SIGNATURE_METHOD: &str = "x-log-signaturemethod";

/// Body format of a PutLogs request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Json,
    Protobuf,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Protobuf => "application/x-protobuf",
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "protobuf" | "pb" => Ok(WireFormat::Protobuf),
            other => Err(format!("unknown wire format '{}'", other)),
        }
    }
}

/// Body compression applied after encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    /// zlib stream, announced as `deflate`
    Deflate,
}

impl Compression {
    /// Value of the `x-log-compresstype` header.
    pub fn marker(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Deflate => "deflate",
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "deflate" => Ok(Compression::Deflate),
            other => Err(format!("unknown compression '{}'", other)),
        }
    }
}

/// Errors raised while building a request body.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to compress body: {0}")]
    Compression(#[from] std::io::Error),
}

/// `Log.Content` message.
#[derive(Clone, PartialEq, Message)]
pub struct LogContent {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// `Log` message.
#[derive(Clone, PartialEq, Message)]
pub struct Log {
    #[prost(uint32, tag = "1")]
    pub time: u32,
    #[prost(message, repeated, tag = "2")]
    pub contents: Vec<LogContent>,
}

/// `LogTag` message.
#[derive(Clone, PartialEq, Message)]
pub struct LogTag {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// `LogGroup` message, the protobuf PutLogs body.
#[derive(Clone, PartialEq, Message)]
pub struct LogGroup {
    #[prost(message, repeated, tag = "1")]
    pub logs: Vec<Log>,
    #[prost(string, optional, tag = "3")]
    pub topic: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub source: Option<String>,
    #[prost(message, repeated, tag = "6")]
    pub log_tags: Vec<LogTag>,
}

#[derive(Serialize)]
struct JsonLogGroup<'a> {
    #[serde(rename = "__topic__")]
    topic: &'a str,
    #[serde(rename = "__source__")]
    source: &'a str,
    #[serde(rename = "__logs__")]
    logs: Vec<JsonLog>,
    #[serde(rename = "__tags__", skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<&'a str, &'a str>,
}

struct JsonLog {
    time: u32,
    contents: Vec<(String, String)>,
}

impl Serialize for JsonLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.contents.len() + 1))?;
        map.serialize_entry("__time__", &self.time)?;
        for (key, value) in &self.contents {
            if key != "__time__" {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

/// An encoded request body ready to be signed and sent.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    /// Bytes to send (compressed when compression is enabled)
    pub body: Vec<u8>,

    /// Length of the uncompressed body
    pub raw_size: usize,

    pub content_type: &'static str,

    /// Uppercase hex MD5 of `body`
    pub content_md5: String,

    pub compression: Compression,
}

/// Converts record batches into PutLogs request bodies.
#[derive(Debug, Clone)]
pub struct WireEncoder {
    format: WireFormat,
    compression: Compression,
    topic: String,
    source: String,
}

impl WireEncoder {
    pub fn new(
        format: WireFormat,
        compression: Compression,
        topic: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            format,
            compression,
            topic: topic.into(),
            source: source.into(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a batch, tagging it with `pack_id` when given.
    pub fn encode(
        &self,
        records: &[EnrichedRecord],
        pack_id: Option<&str>,
    ) -> Result<EncodedBody, EncodeError> {
        let raw = match self.format {
            WireFormat::Json => self.encode_json(records, pack_id)?,
            WireFormat::Protobuf => self.encode_protobuf(records, pack_id),
        };
        let raw_size = raw.len();

        let body = match self.compression {
            Compression::None => raw,
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&raw)?;
                encoder.finish()?
            }
        };

        Ok(EncodedBody {
            content_md5: content_md5(&body),
            body,
            raw_size,
            content_type: self.format.content_type(),
            compression: self.compression,
        })
    }

    fn encode_json(
        &self,
        records: &[EnrichedRecord],
        pack_id: Option<&str>,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut tags = BTreeMap::new();
        if let Some(id) = pack_id {
            tags.insert(PACK_ID_TAG, id);
        }

        let group = JsonLogGroup {
            topic: &self.topic,
            source: &self.source,
            logs: records
                .iter()
                .map(|record| JsonLog {
                    time: record.unix_seconds(),
                    contents: record.contents(),
                })
                .collect(),
            tags,
        };

        Ok(serde_json::to_vec(&group)?)
    }

    fn encode_protobuf(&self, records: &[EnrichedRecord], pack_id: Option<&str>) -> Vec<u8> {
        let group = LogGroup {
            logs: records
                .iter()
                .map(|record| Log {
                    time: record.unix_seconds(),
                    contents: record
                        .contents()
                        .into_iter()
                        .map(|(key, value)| LogContent { key, value })
                        .collect(),
                })
                .collect(),
            topic: Some(self.topic.clone()),
            source: Some(self.source.clone()),
            log_tags: pack_id
                .map(|id| LogTag {
                    key: PACK_ID_TAG.to_string(),
                    value: id.to_string(),
                })
                .into_iter()
                .collect(),
        };

        group.encode_to_vec()
    }

    /// Transport headers for an encoded body, excluding `Authorization`.
    pub fn transport_headers(
        &self,
        body: &EncodedBody,
        host: &str,
        date: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_CONTENT_TYPE.to_string(), body.content_type.to_string());
        headers.insert(HEADER_CONTENT_MD5.to_string(), body.content_md5.clone());
        headers.insert(HEADER_DATE.to_string(), http_date(date));
        headers.insert(HEADER_HOST.to_string(), host.to_string());
        headers.insert(HEADER_API_VERSION.to_string(), API_VERSION.to_string());
        headers.insert(HEADER_BODY_RAW_SIZE.to_string(), body.raw_size.to_string());
        headers.insert(
            HEADER_COMPRESS_TYPE.to_string(),
            body.compression.marker().to_string(),
        );
        headers.insert(
            HEADER_SIGNATURE_METHOD.to_string(),
            SIGNATURE_METHOD.to_string(),
        );
        headers
    }
}

/// Uppercase hex MD5 of the exact bytes.
pub fn content_md5(bytes: &[u8]) -> String {
    format!("{:X}", md5::compute(bytes))
}

/// RFC 1123 date, always in GMT.
pub fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FieldValue, Fields, LogEvent, LogLevel, UNSERIALIZABLE_MARKER};
    use chrono::TimeZone;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn record(message: &str, millis: i64, fields: Fields) -> EnrichedRecord {
        EnrichedRecord {
            event: LogEvent::new(LogLevel::Info, message)
                .with_timestamp(Utc.timestamp_millis_opt(millis).unwrap())
                .with_fields(fields),
            hostname: "host-a".to_string(),
            process_id: 7,
            environment: None,
            app_version: None,
            host_ip: None,
            category: Some("application".to_string()),
            logger: None,
            trace_id: None,
            span_id: None,
            custom: Fields::new(),
        }
    }

    fn batch() -> Vec<EnrichedRecord> {
        vec![
            record("a", 1_700_000_000_123, Fields::new()),
            record("b", 1_700_000_001_999, Fields::new().with("user", "bob")),
            record("c", 1_700_000_002_000, Fields::new()),
        ]
    }

    fn encoder(format: WireFormat, compression: Compression) -> WireEncoder {
        WireEncoder::new(format, compression, "loglayer", "nodejs")
    }

    #[test]
    fn test_json_body_shape() {
        let body = encoder(WireFormat::Json, Compression::None)
            .encode(&batch(), Some("ABC-1"))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body.body).unwrap();

        assert_eq!(json["__topic__"], "loglayer");
        assert_eq!(json["__source__"], "nodejs");
        assert_eq!(json["__tags__"]["__pack_id__"], "ABC-1");

        let logs = json["__logs__"].as_array().unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0]["__time__"], 1_700_000_000);
        assert_eq!(logs[1]["__time__"], 1_700_000_001);
        assert_eq!(logs[2]["__time__"], 1_700_000_002);
        assert_eq!(logs[1]["message"], "b");
        assert_eq!(logs[1]["user"], "bob");
        assert_eq!(logs[0]["level"], "info");
    }

    #[test]
    fn test_json_body_without_pack_id_has_no_tags() {
        let body = encoder(WireFormat::Json, Compression::None)
            .encode(&batch(), None)
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body.body).unwrap();
        assert!(json.get("__tags__").is_none());
    }

    #[test]
    fn test_bad_field_does_not_fail_batch() {
        let bad = Fields::new().with(
            "nested",
            FieldValue::Map(Fields::new().with("x", f64::INFINITY)),
        );
        let records = vec![record("ok", 1_000, Fields::new()), record("bad", 2_000, bad)];

        let body = encoder(WireFormat::Json, Compression::None)
            .encode(&records, None)
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body.body).unwrap();
        assert_eq!(json["__logs__"].as_array().unwrap().len(), 2);
        assert_eq!(json["__logs__"][1]["nested"], UNSERIALIZABLE_MARKER);
    }

    #[test]
    fn test_protobuf_body_decodes() {
        let body = encoder(WireFormat::Protobuf, Compression::None)
            .encode(&batch(), Some("ABC-2"))
            .unwrap();
        assert_eq!(body.content_type, "application/x-protobuf");

        let group = LogGroup::decode(body.body.as_slice()).unwrap();
        assert_eq!(group.logs.len(), 3);
        assert_eq!(group.logs[0].time, 1_700_000_000);
        assert_eq!(group.topic.as_deref(), Some("loglayer"));
        assert_eq!(group.log_tags[0].key, "__pack_id__");
        assert_eq!(group.log_tags[0].value, "ABC-2");
        assert!(group.logs[2]
            .contents
            .iter()
            .any(|c| c.key == "message" && c.value == "c"));
    }

    #[test]
    fn test_deflate_body_inflates_to_raw_size() {
        let body = encoder(WireFormat::Json, Compression::Deflate)
            .encode(&batch(), None)
            .unwrap();

        let mut inflated = Vec::new();
        ZlibDecoder::new(body.body.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated.len(), body.raw_size);
        assert_eq!(body.content_md5, content_md5(&body.body));
    }

    #[test]
    fn test_content_md5_is_uppercase_hex() {
        assert_eq!(content_md5(b"hello"), "5D41402ABC4B2A76B9719D911017C592");
    }

    #[test]
    fn test_md5_covers_multibyte_text() {
        let records = vec![record("héllo 日本", 1_000, Fields::new())];
        let body = encoder(WireFormat::Json, Compression::None)
            .encode(&records, None)
            .unwrap();
        assert_eq!(body.content_md5, format!("{:X}", md5::compute(&body.body)));
        assert!(String::from_utf8(body.body).unwrap().contains("héllo 日本"));
    }

    #[test]
    fn test_http_date_format() {
        let date = Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap();
        assert_eq!(http_date(date), "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn test_transport_headers() {
        let enc = encoder(WireFormat::Json, Compression::None);
        let body = enc.encode(&batch(), None).unwrap();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let headers = enc.transport_headers(&body, "proj.example.com", date);

        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers["Content-MD5"], body.content_md5);
        assert_eq!(headers["Date"], "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(headers["Host"], "proj.example.com");
        assert_eq!(headers["x-log-apiversion"], "0.6.0");
        assert_eq!(headers["x-log-bodyrawsize"], body.raw_size.to_string());
        assert_eq!(headers["x-log-compresstype"], "");
        assert_eq!(headers["x-log-signaturemethod"], "hmac-sha1");
    }

    #[test]
    fn test_format_and_compression_parse() {
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
        assert_eq!("protobuf".parse::<WireFormat>().unwrap(), WireFormat::Protobuf);
        assert!("xml".parse::<WireFormat>().is_err());
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("deflate".parse::<Compression>().unwrap(), Compression::Deflate);
        assert!("lz4".parse::<Compression>().is_err());
    }
}
