//! W3C trace context propagation.
//!
//! Every route call injects a `traceparent`; adapter subprocesses receive it
//! via the `TRACEPARENT` env var so tool calls landing back on the mesh can
//! be stitched into the originating trace.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{TelemetryError, TelemetryResult};

/// Env var carrying the W3C trace context into subprocesses.
pub const TRACEPARENT_ENV: &str = "TRACEPARENT";

const SUPPORTED_VERSION: &str = "00";

/// A parsed W3C `traceparent` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 16-byte trace id, lowercase hex.
    pub trace_id: String,
    /// 8-byte span id of the current hop, lowercase hex.
    pub span_id: String,
    /// Whether the trace is sampled.
    pub sampled: bool,
}

impl TraceContext {
    /// Start a fresh root trace.
    #[must_use]
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0_u8; 16];
        let mut span = [0_u8; 8];
        rng.fill_bytes(&mut trace);
        rng.fill_bytes(&mut span);
        Self {
            trace_id: hex(&trace),
            span_id: hex(&span),
            sampled: true,
        }
    }

    /// Derive a child hop: same trace id, fresh span id.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut span = [0_u8; 8];
        rand::thread_rng().fill_bytes(&mut span);
        Self {
            trace_id: self.trace_id.clone(),
            span_id: hex(&span),
            sampled: self.sampled,
        }
    }

    /// Parse a `traceparent` header value.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidTraceparent`] on any structural
    /// violation (wrong version, field widths, non-hex, all-zero ids).
    pub fn parse(value: &str) -> TelemetryResult<Self> {
        let invalid = || TelemetryError::InvalidTraceparent(value.to_string());
        let mut parts = value.trim().split('-');
        let version = parts.next().ok_or_else(invalid)?;
        let trace_id = parts.next().ok_or_else(invalid)?;
        let span_id = parts.next().ok_or_else(invalid)?;
        let flags = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() || version != SUPPORTED_VERSION {
            return Err(invalid());
        }
        if trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return Err(invalid());
        }
        let all_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !all_hex(trace_id) || !all_hex(span_id) || !all_hex(flags) {
            return Err(invalid());
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return Err(invalid());
        }
        let flag_bits = u8::from_str_radix(flags, 16).map_err(|_| invalid())?;
        let sampled = flag_bits & 0x01 == 0x01;
        Ok(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
        })
    }

    /// Format as a `traceparent` header value.
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("{SUPPORTED_VERSION}-{}-{}-{flags}", self.trace_id, self.span_id)
    }

    /// Read the ambient trace context from `TRACEPARENT`, if present and valid.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var(TRACEPARENT_ENV)
            .ok()
            .and_then(|v| Self::parse(&v).ok())
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
