//! Service and proxy listener declarations.
//!
//! These are the already-expanded inputs the supervisor and proxy receive
//! from the configuration layer. HJSON parsing and template expansion happen
//! upstream; every string here is treated as opaque.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default capacity of a service's log ring buffer.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 1000;

/// Default delay before a policy-driven restart, in milliseconds.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;

/// Default cap on automatic restarts.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default grace period before a stop escalates to SIGKILL, in seconds.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// What to do when a service exits without being asked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart on every exit, clean or not, until the restart cap is hit.
    Always,
    /// Restart only when the exit code is non-zero, until the cap is hit.
    OnFailure,
    /// Never restart automatically.
    #[default]
    Never,
}

/// Signal used to request a service stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopSignal {
    #[default]
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl StopSignal {
    /// Conventional name of the signal.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Kill => "SIGKILL",
        }
    }
}

/// Declaration of one supervised service.
///
/// All fields are optional in the source document except `name` and `argv`;
/// defaults match what the configuration layer documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Unique service name, the key for every supervisor operation.
    pub name: String,
    /// Command line; the first element is the executable.
    pub argv: Vec<String>,
    /// Working directory for the child. Inherits the supervisor's when unset.
    pub work_dir: Option<PathBuf>,
    /// Additional environment variables, merged over the supervisor's own.
    pub env: HashMap<String, String>,
    pub restart_policy: RestartPolicy,
    /// Delay before a policy-driven restart, in milliseconds.
    pub restart_delay_ms: u64,
    pub max_restarts: u32,
    pub stop_signal: StopSignal,
    /// Grace period before stop escalates to SIGKILL, in seconds.
    pub stop_timeout_secs: u64,
    /// Names of services that must be running before this one starts.
    pub depends_on: Vec<String>,
    pub enabled: bool,
    /// Participates in the watched-subset bulk operations.
    pub watching: bool,
    pub log_buffer_size: usize,
    /// Optional parser selector for structured log capture (e.g. `"json"`).
    pub log_parser: Option<String>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            argv: Vec::new(),
            work_dir: None,
            env: HashMap::new(),
            restart_policy: RestartPolicy::default(),
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            stop_signal: StopSignal::default(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            depends_on: Vec::new(),
            enabled: true,
            watching: true,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            log_parser: None,
        }
    }
}

impl ServiceSpec {
    /// Create a minimal spec with defaults for everything but name and argv.
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            ..Self::default()
        }
    }

    /// Effective restart delay.
    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Effective stop grace period.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// TLS termination mode for one proxy listener.
///
/// `Managed` only selects the mode; the certificate-resolution callback is
/// supplied by the embedding application when the listener set is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsSpec {
    #[default]
    None,
    /// Serve TLS with an X.509 key pair loaded from disk. Paths may start
    /// with `~`, expanded against the user's home directory.
    CertKey { cert_path: String, key_path: String },
    /// Certificates are supplied per-SNI at handshake time by a callback.
    Managed,
}

/// One route within a listener: optional path regex plus an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Regex matched against the request path. `None` is a catch-all.
    #[serde(default)]
    pub path_regexp: Option<String>,
    /// Upstream `host:port`, optionally with a scheme (default `http://`).
    pub upstream: String,
}

/// Declaration of one reverse-proxy listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyListenerSpec {
    /// TCP address to bind, e.g. `127.0.0.1:1099`.
    pub listen: String,
    #[serde(default)]
    pub tls: TlsSpec,
    /// Routes in declaration order; first match wins.
    pub routes: Vec<RouteSpec>,
}

/// The fully-expanded configuration handed to the boot sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub services: Vec<ServiceSpec>,
    pub proxies: Vec<ProxyListenerSpec>,
}
