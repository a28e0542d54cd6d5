//! Error types surfaced by the supervisor and proxy cores.

use thiserror::Error;

/// Errors returned by supervisor operations.
///
/// Runtime exits are never surfaced through this type; they manifest as
/// state transitions, events, and the restart machinery.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("dependency not found: {service} depends on {dependency}")]
    DependencyNotFound { service: String, dependency: String },

    #[error("dependency cycle detected: service {0} depends on itself")]
    DependencyCycle(String),

    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal {service}: {message}")]
    Signal { service: String, message: String },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("process for {service} is {state}, cannot start")]
    NotStartable { service: String, state: String },

    /// Aggregate for batch operations; carries the count and the first error.
    #[error("{count} operations failed; first: {first}")]
    Batch {
        count: usize,
        #[source]
        first: Box<SupervisorError>,
    },
}

/// Build-time errors from compiling a proxy listener set. Fatal to startup.
#[derive(Debug, Error)]
pub enum ProxyBuildError {
    #[error("invalid listen address {addr}: {message}")]
    InvalidListenAddr { addr: String, message: String },

    #[error("invalid route regex {pattern:?}: {message}")]
    InvalidRouteRegex { pattern: String, message: String },

    #[error("invalid upstream {upstream:?}: {message}")]
    InvalidUpstream { upstream: String, message: String },

    #[error("failed to load TLS key pair ({cert_path}, {key_path}): {message}")]
    TlsKeyPair {
        cert_path: String,
        key_path: String,
        message: String,
    },

    #[error("listener {listen} requests managed TLS but no certificate resolver was supplied")]
    MissingCertResolver { listen: String },

    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(String),
}
