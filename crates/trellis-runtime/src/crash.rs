//! Crash classification.
//!
//! Pure functions over the last captured log lines plus the exit code; no
//! I/O. The supervisor feeds in roughly the last 50 lines of the exited
//! process when deciding what to publish with a `service.crashed` event.

use std::sync::LazyLock;

use regex::Regex;

use trellis_core::events::CrashReason;

/// Outcome of classifying one exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashResult {
    pub reason: CrashReason,
    pub details: String,
    /// `file:line` when one could be extracted.
    pub location: Option<String>,
    pub stack_trace: Vec<String>,
    pub exit_code: i32,
}

static FILE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_$./\-]+\.[A-Za-z0-9]+):(\d+)").unwrap());

static SIGNAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SIGTERM|SIGKILL|SIGINT)\b|signal:\s*(killed|terminated|interrupt)")
        .unwrap()
});

static FATAL_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFATAL\b").unwrap());

static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"context deadline exceeded|(?i)\btime[d]?\s?out\b").unwrap());

static OS_ERROR_PHRASES: &[&str] = &[
    "connection refused",
    "address already in use",
    "permission denied",
    "no such file or directory",
];

/// Classify an exit from the trailing log lines and the exit code.
#[must_use]
pub fn analyze(lines: &[String], exit_code: i32) -> CrashResult {
    if exit_code == 0 && !lines.iter().any(|l| is_crash_indicator(l)) {
        return result(CrashReason::None, String::new(), None, Vec::new(), exit_code);
    }
    if lines.is_empty() {
        return classify_exit_code(lines, exit_code);
    }

    // Priority scans over the whole window; the first category with any hit
    // wins. OOM outranks fatal because Go-style runtimes report OOM as
    // `fatal error: out of memory`.
    if let Some(res) = scan_panic(lines, exit_code) {
        return res;
    }
    if let Some(res) = scan_contains(lines, exit_code, CrashReason::Oom, |l| {
        let lower = l.to_lowercase();
        lower.contains("out of memory") || lower.contains("cannot allocate memory")
    }) {
        return res;
    }
    if let Some((idx, line)) = find_prefixed(lines, "fatal error:") {
        let details = line.trim()["fatal error:".len()..].trim().to_string();
        let location = lines[idx..].iter().find_map(|l| extract_location(l));
        return result(CrashReason::Fatal, details, location, Vec::new(), exit_code);
    }
    if let Some(res) = scan_signal(lines, exit_code) {
        return res;
    }
    if let Some(res) = scan_contains(lines, exit_code, CrashReason::LogFatal, |l| {
        FATAL_KEYWORD_RE.is_match(l)
    }) {
        return res;
    }
    if let Some(res) = scan_contains(lines, exit_code, CrashReason::Timeout, |l| {
        TIMEOUT_RE.is_match(l)
    }) {
        return res;
    }
    if let Some(res) = scan_error(lines, exit_code) {
        return res;
    }

    classify_exit_code(lines, exit_code)
}

/// Conventional names for the low signal numbers; anything else is just
/// `signal`.
#[must_use]
pub const fn signal_name(signo: i32) -> &'static str {
    match signo {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        _ => "signal",
    }
}

fn is_crash_indicator(line: &str) -> bool {
    let trimmed = line.trim();
    let lower = trimmed.to_lowercase();
    lower.starts_with("panic:")
        || lower.starts_with("fatal error:")
        || lower.starts_with("error:")
        || lower.contains("out of memory")
        || lower.contains("cannot allocate memory")
        || OS_ERROR_PHRASES.iter().any(|p| lower.contains(p))
        || SIGNAL_RE.is_match(trimmed)
        || FATAL_KEYWORD_RE.is_match(trimmed)
        || TIMEOUT_RE.is_match(trimmed)
}

fn scan_panic(lines: &[String], exit_code: i32) -> Option<CrashResult> {
    let (idx, line) = find_prefixed(lines, "panic:")?;
    let details = line.trim()["panic:".len()..].trim().to_string();

    // Walk forward for a stack-trace marker, then collect the frames that
    // follow; the first frame carrying a path:line becomes the location.
    let mut stack_trace = Vec::new();
    let mut location = None;
    let mut in_trace = false;
    for candidate in &lines[idx + 1..] {
        let trimmed = candidate.trim();
        if !in_trace {
            if trimmed.starts_with("goroutine ") || trimmed.contains("stack trace") {
                in_trace = true;
            }
            continue;
        }
        if trimmed.is_empty() {
            break;
        }
        stack_trace.push(trimmed.to_string());
        if location.is_none() {
            location = extract_location(trimmed);
        }
    }
    Some(result(CrashReason::Panic, details, location, stack_trace, exit_code))
}

fn scan_signal(lines: &[String], exit_code: i32) -> Option<CrashResult> {
    for line in lines {
        if let Some(caps) = SIGNAL_RE.captures(line) {
            let details = caps.get(1).map_or_else(
                || match caps.get(2).map(|m| m.as_str().to_lowercase()).as_deref() {
                    Some("killed") => "SIGKILL".to_string(),
                    Some("interrupt") => "SIGINT".to_string(),
                    _ => "SIGTERM".to_string(),
                },
                |m| m.as_str().to_uppercase(),
            );
            return Some(result(CrashReason::Signal, details, None, Vec::new(), exit_code));
        }
    }
    None
}

fn scan_error(lines: &[String], exit_code: i32) -> Option<CrashResult> {
    for line in lines {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if lower.starts_with("error:") || OS_ERROR_PHRASES.iter().any(|p| lower.contains(p)) {
            return Some(result(
                CrashReason::Error,
                trimmed.to_string(),
                extract_location(trimmed),
                Vec::new(),
                exit_code,
            ));
        }
    }
    None
}

fn scan_contains(
    lines: &[String],
    exit_code: i32,
    reason: CrashReason,
    pred: impl Fn(&str) -> bool,
) -> Option<CrashResult> {
    lines
        .iter()
        .find(|l| pred(l))
        .map(|l| result(reason, l.trim().to_string(), None, Vec::new(), exit_code))
}

fn classify_exit_code(lines: &[String], exit_code: i32) -> CrashResult {
    match exit_code {
        0 => result(CrashReason::None, String::new(), None, Vec::new(), exit_code),
        code if code >= 128 => result(
            CrashReason::Signal,
            signal_name(code - 128).to_string(),
            None,
            Vec::new(),
            exit_code,
        ),
        code if code > 0 => {
            let tail: Vec<&str> = lines
                .iter()
                .rev()
                .filter(|l| !l.trim().is_empty())
                .take(3)
                .map(|l| l.trim())
                .collect();
            let details = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
            result(CrashReason::Error, details, None, Vec::new(), exit_code)
        }
        _ => result(CrashReason::Unknown, String::new(), None, Vec::new(), exit_code),
    }
}

fn find_prefixed<'a>(lines: &'a [String], prefix: &str) -> Option<(usize, &'a String)> {
    lines
        .iter()
        .enumerate()
        .find(|(_, l)| l.trim().to_lowercase().starts_with(prefix))
}

fn extract_location(line: &str) -> Option<String> {
    FILE_LINE_RE
        .captures(line)
        .map(|caps| format!("{}:{}", &caps[1], &caps[2]))
}

fn result(
    reason: CrashReason,
    details: String,
    location: Option<String>,
    stack_trace: Vec<String>,
    exit_code: i32,
) -> CrashResult {
    CrashResult {
        reason,
        details,
        location,
        stack_trace,
        exit_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn clean_exit_with_quiet_logs_is_none() {
        let res = analyze(&owned(&["listening on :3000", "bye"]), 0);
        assert_eq!(res.reason, CrashReason::None);
    }

    #[test]
    fn no_logs_falls_back_to_exit_code() {
        assert_eq!(analyze(&[], 0).reason, CrashReason::None);
        assert_eq!(analyze(&[], 1).reason, CrashReason::Error);
        let sig = analyze(&[], 137);
        assert_eq!(sig.reason, CrashReason::Signal);
        assert_eq!(sig.details, "SIGKILL");
    }

    #[test]
    fn panic_with_stack_trace_extracts_location() {
        let lines = owned(&[
            "starting up",
            "panic: runtime error: index out of range [3]",
            "",
            "goroutine 1 [running]:",
            "main.handle(...)",
            "\t/src/app/main.go:42 +0x1b",
            "main.main()",
        ]);
        let res = analyze(&lines, 2);
        assert_eq!(res.reason, CrashReason::Panic);
        assert_eq!(res.details, "runtime error: index out of range [3]");
        assert_eq!(res.location.as_deref(), Some("/src/app/main.go:42"));
        assert_eq!(res.stack_trace.len(), 3);
    }

    #[test]
    fn panic_details_without_trace() {
        let res = analyze(&owned(&["panic: boom"]), 2);
        assert_eq!(res.reason, CrashReason::Panic);
        assert_eq!(res.details, "boom");
        assert!(res.location.is_none());
    }

    #[test]
    fn oom_outranks_fatal_error() {
        let res = analyze(&owned(&["fatal error: out of memory"]), 2);
        assert_eq!(res.reason, CrashReason::Oom);
    }

    #[test]
    fn fatal_error_prefix_classified() {
        let res = analyze(&owned(&["fatal error: concurrent map writes"]), 2);
        assert_eq!(res.reason, CrashReason::Fatal);
        assert_eq!(res.details, "concurrent map writes");
    }

    #[test]
    fn signal_mention_extracts_name() {
        let res = analyze(&owned(&["process received sigterm, shutting down"]), 1);
        assert_eq!(res.reason, CrashReason::Signal);
        assert_eq!(res.details, "SIGTERM");

        let res = analyze(&owned(&["signal: killed"]), 1);
        assert_eq!(res.details, "SIGKILL");
    }

    #[test]
    fn fatal_log_keyword_classified() {
        let res = analyze(&owned(&["2024-01-01 FATAL could not bind listener"]), 1);
        assert_eq!(res.reason, CrashReason::LogFatal);
    }

    #[test]
    fn timeout_phrases_classified() {
        let res = analyze(&owned(&["rpc failed: context deadline exceeded"]), 1);
        assert_eq!(res.reason, CrashReason::Timeout);
    }

    #[test]
    fn error_prefix_and_os_phrases_classified() {
        let res = analyze(&owned(&["error: open config.yaml:12 failed"]), 1);
        assert_eq!(res.reason, CrashReason::Error);
        assert_eq!(res.location.as_deref(), Some("config.yaml:12"));

        let res = analyze(&owned(&["dial tcp 127.0.0.1:5432: connection refused"]), 1);
        assert_eq!(res.reason, CrashReason::Error);
    }

    #[test]
    fn nonzero_exit_with_plain_logs_joins_last_lines() {
        let lines = owned(&["one", "", "two", "three", ""]);
        let res = analyze(&lines, 3);
        assert_eq!(res.reason, CrashReason::Error);
        assert_eq!(res.details, "one | two | three");
    }

    #[test]
    fn signal_name_table() {
        assert_eq!(signal_name(1), "SIGHUP");
        assert_eq!(signal_name(2), "SIGINT");
        assert_eq!(signal_name(3), "SIGQUIT");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(11), "SIGSEGV");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(7), "signal");
    }
}
