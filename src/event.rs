//! Log event types shared by the buffer, encoder and delivery client.
//!
//! A [`LogEvent`] is what the embedding application hands over; an
//! [`EnrichedRecord`] is what sits in the pending queue and goes on the wire.

use chrono::{DateTime, Utc};
use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Serialize, Serializer};

/// Placeholder written in place of a field value that cannot be encoded.
pub const UNSERIALIZABLE_MARKER: &str = "[Unserializable Object]";

/// Log severity levels accepted by the shipper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Get all possible log levels.
    pub fn all() -> &'static [LogLevel] {
        &[LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "fatal" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// A structured field value.
///
/// Closed over the shapes the remote service can represent once flattened
/// to strings: scalars, null, and nested maps (rendered as JSON).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
    Map(Fields),
}

impl FieldValue {
    /// Render the value as the flat string the service stores.
    ///
    /// Maps are JSON-encoded. A map that cannot be encoded (e.g. it holds a
    /// non-finite float) yields [`UNSERIALIZABLE_MARKER`] instead of an error.
    pub fn to_wire_string(&self) -> String {
        match self {
            FieldValue::String(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null => "null".to_string(),
            FieldValue::Map(map) => serde_json::to_string(map)
                .unwrap_or_else(|_| UNSERIALIZABLE_MARKER.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Integer(i) => serializer.serialize_i64(*i),
            FieldValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            FieldValue::Float(f) => Err(S::Error::custom(format!("non-finite float {}", f))),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Map(map) => map.serialize(serializer),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Fields> for FieldValue {
    fn from(value: Fields) -> Self {
        FieldValue::Map(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Insertion-ordered string keyed map of field values.
///
/// Inserting an existing key replaces the value in place and keeps the
/// original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// A single log event produced by the application's logging front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Fields,
}

impl LogEvent {
    /// Create a new event stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            fields: Fields::new(),
        }
    }

    /// Attach structured fields to the event.
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A log event plus the system-derived fields added at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub event: LogEvent,
    pub hostname: String,
    pub process_id: u32,
    pub environment: Option<String>,
    pub app_version: Option<String>,
    pub host_ip: Option<String>,
    pub category: Option<String>,
    pub logger: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    /// Static fields configured on the shipper.
    pub custom: Fields,
}

impl EnrichedRecord {
    /// Seconds since the epoch, as the service's `__time__` expects.
    pub fn unix_seconds(&self) -> u32 {
        self.event.timestamp.timestamp_millis().div_euclid(1000).max(0) as u32
    }

    /// Flatten the record into ordered key/value string pairs.
    ///
    /// Order: level, message, enrichment fields, custom fields, then the
    /// event's own fields. Later keys override earlier ones in place.
    pub fn contents(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::with_capacity(12 + self.event.fields.len());
        let mut put = |key: &str, value: String| {
            match out.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = value,
                None => out.push((key.to_string(), value)),
            }
        };

        put("level", self.event.level.to_string());
        put("message", self.event.message.clone());
        put("hostname", self.hostname.clone());
        put("pid", self.process_id.to_string());
        if let Some(env) = &self.environment {
            put("environment", env.clone());
        }
        if let Some(version) = &self.app_version {
            put("version", version.clone());
        }
        if let Some(ip) = &self.host_ip {
            put("hostIP", ip.clone());
        }
        if let Some(category) = &self.category {
            put("category", category.clone());
        }
        if let Some(logger) = &self.logger {
            put("logger", logger.clone());
        }
        if let Some(trace_id) = &self.trace_id {
            put("traceId", trace_id.clone());
        }
        if let Some(span_id) = &self.span_id {
            put("spanId", span_id.clone());
        }
        for (key, value) in self.custom.iter() {
            put(key, value.to_wire_string());
        }
        for (key, value) in self.event.fields.iter() {
            put(key, value.to_wire_string());
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(event: LogEvent) -> EnrichedRecord {
        EnrichedRecord {
            event,
            hostname: "host-a".to_string(),
            process_id: 42,
            environment: Some("test".to_string()),
            app_version: None,
            host_ip: None,
            category: Some("application".to_string()),
            logger: None,
            trace_id: None,
            span_id: None,
            custom: Fields::new(),
        }
    }

    #[test]
    fn test_log_level_display_and_parse() {
        for level in LogLevel::all() {
            let parsed: LogLevel = level.to_string().parse().unwrap();
            assert_eq!(parsed, *level);
        }
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_fields_keep_insertion_order_and_replace_in_place() {
        let mut fields = Fields::new().with("b", 1).with("a", "x");
        fields.insert("b", 2);

        let keys: Vec<&str> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(fields.get("b"), Some(&FieldValue::Integer(2)));
    }

    #[test]
    fn test_field_value_wire_strings() {
        assert_eq!(FieldValue::from("plain").to_wire_string(), "plain");
        assert_eq!(FieldValue::from(7).to_wire_string(), "7");
        assert_eq!(FieldValue::from(1.5).to_wire_string(), "1.5");
        assert_eq!(FieldValue::from(true).to_wire_string(), "true");
        assert_eq!(FieldValue::Null.to_wire_string(), "null");

        let nested = Fields::new().with("user", "bob").with("age", 30);
        assert_eq!(
            FieldValue::from(nested).to_wire_string(),
            r#"{"user":"bob","age":30}"#
        );
    }

    #[test]
    fn test_unserializable_map_becomes_marker() {
        let bad = Fields::new().with("ratio", f64::NAN);
        assert_eq!(FieldValue::from(bad).to_wire_string(), UNSERIALIZABLE_MARKER);
    }

    #[test]
    fn test_unix_seconds_floors_millis() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_999).unwrap();
        let rec = record(LogEvent::new(LogLevel::Info, "hi").with_timestamp(ts));
        assert_eq!(rec.unix_seconds(), 1_700_000_000);
    }

    #[test]
    fn test_contents_order_and_override() {
        let event = LogEvent::new(LogLevel::Error, "boom")
            .with_fields(Fields::new().with("category", "db").with("rows", 3));
        let contents = record(event).contents();

        assert_eq!(contents[0], ("level".to_string(), "error".to_string()));
        assert_eq!(contents[1], ("message".to_string(), "boom".to_string()));

        let category: Vec<_> = contents.iter().filter(|(k, _)| k == "category").collect();
        assert_eq!(category.len(), 1);
        assert_eq!(category[0].1, "db");
        assert_eq!(contents.last().unwrap(), &("rows".to_string(), "3".to_string()));
    }
}
