//! Ports the supervisor core depends on.
//!
//! All three ports are object-safe and synchronous fire-and-forget: adapters
//! handle their own errors internally rather than propagating them into the
//! lifecycle engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SupervisorEvent;

/// A parsed log record produced by a `LogParser`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp extracted from the line, when present.
    pub timestamp: Option<DateTime<Utc>>,
    /// Severity token extracted from the line, when present.
    pub level: Option<String>,
    pub message: String,
    /// Remaining structured fields.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// The unmodified source line.
    pub raw: String,
}

/// Parses one raw line into a structured record.
///
/// Returning `None` means the line did not match the grammar; the raw line
/// is stored regardless, so parsers never need to invent fallback records.
pub trait LogParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<LogEntry>;
}

/// Post-parse transform applied to an entry's fields. Opaque to the core.
pub trait LogDeriver: Send + Sync {
    fn apply(&self, entry: &mut LogEntry);
}

/// Sink for lifecycle events.
///
/// Publish is fire-and-forget by design: the supervisor must never block or
/// fail because an event consumer is slow or absent.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: SupervisorEvent);
}

/// An `EventBus` that discards everything. Useful in tests and tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _event: SupervisorEvent) {}
}
