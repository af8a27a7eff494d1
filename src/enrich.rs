//! Turns incoming events into enriched records.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

use tracing::debug;

use crate::config::EnrichmentConfig;
use crate::event::{EnrichedRecord, Fields, LogEvent};
use crate::trace::{TraceContext, TraceContextHolder};

/// Category used when an event names neither a category nor a module.
pub const DEFAULT_CATEGORY: &str = "application";

/// Facts about the current host and process, gathered once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub process_id: u32,
    pub host_ip: Option<String>,
}

impl HostInfo {
    /// Detect hostname and pid. The IP is only looked up when `with_ip` is set.
    pub fn detect(with_ip: bool) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let host_ip = if with_ip { detect_host_ip() } else { None };
        debug!(hostname = %hostname, host_ip = ?host_ip, "Host info detected");

        Self {
            hostname,
            process_id: std::process::id(),
            host_ip,
        }
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route, no packet is sent.
fn detect_host_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4.to_string()),
        IpAddr::V6(v6) if !v6.is_loopback() && !v6.is_unspecified() => Some(v6.to_string()),
        _ => None,
    }
}

/// Category from the event's `category` or `module` field.
pub fn infer_category(fields: &Fields) -> String {
    ["category", "module"]
        .iter()
        .filter_map(|key| fields.get(key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CATEGORY)
        .to_string()
}

/// Trace context carried in the event's own fields, if well formed.
pub fn inherited_trace(fields: &Fields) -> Option<TraceContext> {
    let lookup = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|key| fields.get(key).and_then(|v| v.as_str()))
    };
    let trace_id = lookup(["traceId", "trace_id"])?;
    TraceContext::from_parts(trace_id, lookup(["spanId", "span_id"]))
}

/// Adds host, process, environment and correlation fields to events.
#[derive(Debug, Clone)]
pub struct Enricher {
    host: HostInfo,
    config: EnrichmentConfig,
    traces: Arc<TraceContextHolder>,
}

impl Enricher {
    pub fn new(host: HostInfo, config: EnrichmentConfig, traces: Arc<TraceContextHolder>) -> Self {
        Self {
            host,
            config,
            traces,
        }
    }

    pub fn traces(&self) -> &Arc<TraceContextHolder> {
        &self.traces
    }

    /// Build the record for an event.
    ///
    /// Trace ids come from `explicit` first, then from the event's own
    /// `traceId`/`spanId` fields, and finally from the current trace holder,
    /// which mints a trace on first use.
    pub fn enrich(&self, event: LogEvent, explicit: Option<&TraceContext>) -> EnrichedRecord {
        let cfg = &self.config;

        let trace = if cfg.include_trace {
            explicit
                .cloned()
                .or_else(|| inherited_trace(&event.fields))
                .or_else(|| Some(self.traces.get_or_generate()))
        } else {
            None
        };
        let (trace_id, span_id) = match trace {
            Some(ctx) => (Some(ctx.trace_id), Some(ctx.span_id)),
            None => (None, None),
        };

        EnrichedRecord {
            category: cfg.include_category.then(|| infer_category(&event.fields)),
            hostname: self.host.hostname.clone(),
            process_id: self.host.process_id,
            environment: cfg.include_environment.then(|| cfg.environment.clone()),
            app_version: cfg.include_version.then(|| cfg.app_version.clone()),
            host_ip: if cfg.include_host_ip {
                self.host.host_ip.clone()
            } else {
                None
            },
            logger: cfg.include_logger.then(|| cfg.logger_name.clone()),
            trace_id,
            span_id,
            custom: cfg.custom_fields.clone(),
            event,
        }
    }
}
