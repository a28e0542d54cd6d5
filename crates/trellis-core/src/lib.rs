//! Core domain types and port definitions for trellis.
//!
//! This crate carries no runtime machinery: only the configuration shapes
//! handed in by the config layer, the lifecycle event vocabulary, the ports
//! the engine publishes through, and the error types the public operations
//! return.

pub mod config;
pub mod error;
pub mod events;
pub mod ports;

// Re-export commonly used types for convenience
pub use config::{
    ProxyListenerSpec, RestartPolicy, RouteSpec, ServiceSpec, StopSignal, TlsSpec, TrellisConfig,
};
pub use error::{ProxyBuildError, SupervisorError};
pub use events::{CrashReason, RestartTrigger, SupervisorEvent};
pub use ports::{EventBus, LogDeriver, LogEntry, LogParser, NoopEventBus};
