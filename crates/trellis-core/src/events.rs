//! Service lifecycle events.
//!
//! These events are emitted by the supervisor and consumed through the
//! `EventBus` port. Consumers should treat them as the sole source of truth
//! for service lifecycle; payload keys are stable.

use serde::{Deserialize, Serialize};

/// What initiated a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartTrigger {
    /// Operator-initiated restart; resets the restart counter.
    Manual,
    /// Restart scheduled by the crash handler.
    Crash,
    /// Restart triggered by a binary-change watch.
    Watch,
    /// Restart propagated from a dependency.
    Dependency,
}

/// Classified cause of an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashReason {
    None,
    Panic,
    Fatal,
    #[serde(rename = "log.fatal")]
    LogFatal,
    Error,
    Oom,
    Signal,
    Timeout,
    Unknown,
}

impl CrashReason {
    /// Stable string form, matching the serialized representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Panic => "panic",
            Self::Fatal => "fatal",
            Self::LogFatal => "log.fatal",
            Self::Error => "error",
            Self::Oom => "oom",
            Self::Signal => "signal",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CrashReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service lifecycle event payload.
///
/// For any single exit, exactly one of `Stopped` or `Crashed` is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SupervisorEvent {
    #[serde(rename = "service.started")]
    Started { service: String, pid: u32 },

    #[serde(rename = "service.stopped")]
    Stopped { service: String, exit_code: i32 },

    #[serde(rename = "service.restarted")]
    Restarted {
        service: String,
        trigger: RestartTrigger,
    },

    #[serde(rename = "service.crashed")]
    Crashed {
        service: String,
        exit_code: i32,
        reason: CrashReason,
        details: String,
    },
}

impl SupervisorEvent {
    /// Name of the service the event concerns.
    #[must_use]
    pub fn service(&self) -> &str {
        match self {
            Self::Started { service, .. }
            | Self::Stopped { service, .. }
            | Self::Restarted { service, .. }
            | Self::Crashed { service, .. } => service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_stable_type_tag() {
        let event = SupervisorEvent::Started {
            service: "web".into(),
            pid: 4242,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"service.started\""));
        assert!(json.contains("\"service\":\"web\""));
        assert!(json.contains("\"pid\":4242"));
    }

    #[test]
    fn crash_reason_round_trips_log_fatal() {
        let json = serde_json::to_string(&CrashReason::LogFatal).unwrap();
        assert_eq!(json, "\"log.fatal\"");
        let back: CrashReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CrashReason::LogFatal);
    }

    #[test]
    fn crashed_event_carries_reason_and_details() {
        let event = SupervisorEvent::Crashed {
            service: "api".into(),
            exit_code: 2,
            reason: CrashReason::Panic,
            details: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"service.crashed\""));
        assert!(json.contains("\"reason\":\"panic\""));
        assert!(json.contains("\"details\":\"boom\""));
    }
}
