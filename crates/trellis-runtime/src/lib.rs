//! Process supervision engine for trellis.
//!
//! The pieces, leaves first: `logbuf` (bounded ring with live fan-out),
//! `crash` (pure exit classification), `process` (one child OS process),
//! `supervisor` (the managed set with dependency ordering and restart
//! policy), plus the broadcast event bus and the built-in JSON log parser.

pub mod bus;
pub mod crash;
pub mod logbuf;
pub mod parser;
pub mod process;
pub mod supervisor;

// Re-export commonly used types
pub use bus::BroadcastEventBus;
pub use crash::{CrashResult, analyze, signal_name};
pub use logbuf::{LogBuffer, LogSubscription, LogUpdate};
pub use parser::JsonLogParser;
pub use process::{Process, ProcessInfo, ProcessState};
pub use supervisor::{ServiceStatus, ServiceSupervisor};
