//! Signal delivery to process groups.
//!
//! Services commonly spawn sub-shells and helpers, so stop semantics target
//! the whole process group rather than just the leader. Children are placed
//! into their own group at spawn time.

use std::io;

use trellis_core::config::StopSignal;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Normalize a signal name: trim, uppercase, accept both `TERM` and
/// `SIGTERM` spellings.
fn canonical(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    }
}

/// Signals that mark the subsequent exit as an answered stop request, so it
/// is classified as a clean stop rather than a crash.
#[must_use]
pub fn is_stop_signal_name(name: &str) -> bool {
    matches!(canonical(name).as_str(), "SIGTERM" | "SIGINT" | "SIGKILL")
}

#[cfg(unix)]
fn signal_from_name(name: &str) -> Option<Signal> {
    match canonical(name).as_str() {
        "SIGHUP" => Some(Signal::SIGHUP),
        "SIGINT" => Some(Signal::SIGINT),
        "SIGQUIT" => Some(Signal::SIGQUIT),
        "SIGKILL" => Some(Signal::SIGKILL),
        "SIGUSR1" => Some(Signal::SIGUSR1),
        "SIGUSR2" => Some(Signal::SIGUSR2),
        "SIGTERM" => Some(Signal::SIGTERM),
        _ => None,
    }
}

/// The `nix` signal for a configured stop signal.
#[cfg(unix)]
pub const fn stop_signal(sig: StopSignal) -> Signal {
    match sig {
        StopSignal::Term => Signal::SIGTERM,
        StopSignal::Int => Signal::SIGINT,
        StopSignal::Kill => Signal::SIGKILL,
    }
}

/// Send a signal to the child's whole process group.
///
/// ESRCH means the group is already gone, which callers treat as success.
#[cfg(unix)]
pub fn kill_group(pgid: u32, sig: Signal) -> io::Result<()> {
    match signal::killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Send a named signal to the child's process group.
#[cfg(unix)]
pub fn kill_group_by_name(pgid: u32, name: &str) -> io::Result<()> {
    let sig = signal_from_name(name).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("unknown signal: {name}"))
    })?;
    kill_group(pgid, sig)
}

// Windows has no process groups or POSIX signals; group signalling is
// unsupported there rather than silently degraded to leader-only kills.
#[cfg(not(unix))]
pub fn kill_group_by_name(_pgid: u32, _name: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-group signalling is only supported on Unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_names_recognized_in_both_spellings() {
        assert!(is_stop_signal_name("SIGTERM"));
        assert!(is_stop_signal_name("term"));
        assert!(is_stop_signal_name("KILL"));
        assert!(is_stop_signal_name("sigint"));
        assert!(!is_stop_signal_name("SIGHUP"));
        assert!(!is_stop_signal_name("USR1"));
    }

    #[test]
    #[cfg(unix)]
    fn name_mapping_covers_the_supported_set() {
        assert_eq!(signal_from_name("HUP"), Some(Signal::SIGHUP));
        assert_eq!(signal_from_name("SIGUSR2"), Some(Signal::SIGUSR2));
        assert_eq!(signal_from_name("SIGWINCH"), None);
    }

    #[test]
    #[cfg(unix)]
    fn kill_group_tolerates_missing_group() {
        // A group id that's very unlikely to exist.
        assert!(kill_group(999_999, Signal::SIGTERM).is_ok());
    }
}
