//! Distributed-trace correlation ids.
//!
//! Trace ids are 128-bit and span ids 64-bit, both rendered as lowercase hex
//! and never all zeros. The preferred way to correlate records is to pass a
//! [`TraceContext`] explicitly with each submission. For hosts that cannot
//! thread a context through their call chains, a [`TraceContextHolder`] keeps
//! a guarded "current trace": every shipper owns one, and [`global`] exposes a
//! process-wide instance as the last resort.

use std::sync::{OnceLock, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const TRACE_ID_HEX_LEN: usize = 32;
pub const SPAN_ID_HEX_LEN: usize = 16;

/// Generate a random, non-zero 128-bit trace id.
pub fn generate_trace_id() -> String {
    random_hex::<16>()
}

/// Generate a random, non-zero 64-bit span id.
pub fn generate_span_id() -> String {
    random_hex::<8>()
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    let mut rng = rand::thread_rng();
    loop {
        rng.fill_bytes(&mut bytes);
        if bytes.iter().any(|b| *b != 0) {
            return hex::encode(bytes);
        }
    }
}

pub fn is_valid_trace_id(id: &str) -> bool {
    is_valid_hex_id(id, TRACE_ID_HEX_LEN)
}

pub fn is_valid_span_id(id: &str) -> bool {
    is_valid_hex_id(id, SPAN_ID_HEX_LEN)
}

fn is_valid_hex_id(id: &str, len: usize) -> bool {
    id.len() == len
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && id.bytes().any(|b| b != b'0')
}

/// A trace id paired with the span it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
        }
    }

    /// Build a context from inherited ids.
    ///
    /// Returns `None` if the trace id is malformed. A malformed or missing
    /// span id is replaced with a fresh one.
    pub fn from_parts(trace_id: &str, span_id: Option<&str>) -> Option<Self> {
        let trace_id = trace_id.to_ascii_lowercase();
        if !is_valid_trace_id(&trace_id) {
            return None;
        }
        let span_id = span_id
            .map(str::to_ascii_lowercase)
            .filter(|id| is_valid_span_id(id))
            .unwrap_or_else(generate_span_id);
        Some(Self { trace_id, span_id })
    }

    /// Same trace, new span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
        }
    }
}

/// Guarded slot holding the current trace context.
#[derive(Debug, Default)]
pub struct TraceContextHolder {
    current: RwLock<Option<TraceContext>>,
}

impl TraceContextHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, context: TraceContext) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(context);
    }

    pub fn get(&self) -> Option<TraceContext> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }

    /// Mint a new root context and make it current.
    pub fn generate_new(&self) -> TraceContext {
        let context = TraceContext::new_root();
        self.set(context.clone());
        context
    }

    /// Current context, generating and storing one on first use.
    pub fn get_or_generate(&self) -> TraceContext {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        current.get_or_insert_with(TraceContext::new_root).clone()
    }
}

/// Process-wide trace holder for hosts without explicit context passing.
pub fn global() -> &'static TraceContextHolder {
    static GLOBAL: OnceLock<TraceContextHolder> = OnceLock::new();
    GLOBAL.get_or_init(TraceContextHolder::new)
}
