//! Built-in log parsers.
//!
//! The only parser shipped with the engine understands JSON-lines output;
//! anything richer is supplied through the `LogParser` port by the
//! embedding application.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use trellis_core::ports::{LogEntry, LogParser};

const TIMESTAMP_KEYS: &[&str] = &["ts", "time", "timestamp"];
const LEVEL_KEYS: &[&str] = &["level", "lvl", "severity"];
const MESSAGE_KEYS: &[&str] = &["msg", "message"];

/// Parses lines that are single JSON objects, the common shape of
/// structured service logs. Non-object lines yield `None`.
#[derive(Debug, Default)]
pub struct JsonLogParser;

impl LogParser for JsonLogParser {
    fn parse(&self, line: &str) -> Option<LogEntry> {
        let Value::Object(mut map) = serde_json::from_str::<Value>(line.trim()).ok()? else {
            return None;
        };

        let timestamp = take_first(&mut map, TIMESTAMP_KEYS).and_then(parse_timestamp);
        let level = take_first(&mut map, LEVEL_KEYS).and_then(|v| match v {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });
        let message = take_first(&mut map, MESSAGE_KEYS)
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();

        Some(LogEntry {
            timestamp,
            level,
            message,
            fields: map,
            raw: line.to_string(),
        })
    }
}

/// Resolve a spec's parser selector to a parser instance. Unknown selectors
/// are logged and ignored so a typo in config degrades to raw capture.
#[must_use]
pub fn parser_for(selector: &str) -> Option<Arc<dyn LogParser>> {
    match selector {
        "json" => Some(Arc::new(JsonLogParser)),
        other => {
            warn!(parser = %other, "unknown log parser selector, storing raw lines only");
            None
        }
    }
}

fn take_first(map: &mut serde_json::Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|k| map.remove(*k))
}

fn parse_timestamp(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            // Heuristic split between seconds and milliseconds since epoch.
            let raw = n.as_i64()?;
            if raw > 10_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_line() {
        let parser = JsonLogParser;
        let entry = parser
            .parse(r#"{"ts":"2024-03-01T12:00:00Z","level":"info","msg":"ready","port":3000}"#)
            .unwrap();
        assert_eq!(entry.level.as_deref(), Some("info"));
        assert_eq!(entry.message, "ready");
        assert_eq!(entry.fields["port"], 3000);
        assert!(entry.timestamp.is_some());
    }

    #[test]
    fn epoch_millis_timestamps_accepted() {
        let parser = JsonLogParser;
        let entry = parser.parse(r#"{"time":1709294400000,"msg":"tick"}"#).unwrap();
        assert_eq!(entry.timestamp.unwrap().timestamp(), 1_709_294_400);
    }

    #[test]
    fn non_json_lines_yield_none() {
        let parser = JsonLogParser;
        assert!(parser.parse("plain text line").is_none());
        assert!(parser.parse("[1,2,3]").is_none());
    }

    #[test]
    fn unknown_selector_resolves_to_no_parser() {
        assert!(parser_for("json").is_some());
        assert!(parser_for("logfmt").is_none());
    }
}
