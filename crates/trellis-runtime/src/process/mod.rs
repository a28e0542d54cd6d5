//! Child process lifecycle.
//!
//! One `Process` owns one child OS process from spawn to reap: it captures
//! stdout and stderr line-by-line into the owned `LogBuffer`, places the
//! child into its own process group so stop signals reach the whole tree,
//! and reports the exit through a callback when the exit was not requested.

pub mod signal;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use trellis_core::config::ServiceSpec;
use trellis_core::error::SupervisorError;

use crate::logbuf::{LogBuffer, LogSubscription};
use crate::parser;

/// Process lifecycle states.
///
/// `Stopped → Starting → Running → Stopping → Stopped` on the clean path;
/// `Running → Crashed` when a non-requested exit returns non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the mutable lifecycle fields.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

/// Invoked by the waiter when the child exits without a stop request.
pub type ExitCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// One child OS process plus its log buffer.
pub struct Process {
    spec: ServiceSpec,
    logbuf: Arc<LogBuffer>,
    info: Mutex<ProcessInfo>,
    stop_requested: AtomicBool,
    exit_tx: watch::Sender<Option<i32>>,
    exit_cb: Mutex<Option<ExitCallback>>,
}

impl Process {
    /// Create a process in the `Stopped` state. The log buffer is sized and
    /// configured from the spec; nothing is spawned yet.
    #[must_use]
    pub fn new(spec: ServiceSpec) -> Self {
        let logbuf = Arc::new(LogBuffer::new(spec.log_buffer_size));
        if let Some(selector) = &spec.log_parser {
            logbuf.set_parser(parser::parser_for(selector), None);
        }
        let (exit_tx, _) = watch::channel(None);
        Self {
            spec,
            logbuf,
            info: Mutex::new(ProcessInfo {
                state: ProcessState::Stopped,
                pid: None,
                started_at: None,
                stopped_at: None,
                exit_code: None,
            }),
            stop_requested: AtomicBool::new(false),
            exit_tx,
            exit_cb: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    #[must_use]
    pub fn info(&self) -> ProcessInfo {
        self.info.lock().unwrap().clone()
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.info.lock().unwrap().state
    }

    /// True until the first `start`; the supervisor replaces non-fresh
    /// processes instead of restarting them in place.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        let info = self.info.lock().unwrap();
        info.state == ProcessState::Stopped && info.started_at.is_none()
    }

    /// Install the callback fired on a non-requested exit. Replaces any
    /// previously installed callback.
    pub fn set_exit_callback(&self, cb: ExitCallback) {
        *self.exit_cb.lock().unwrap() = Some(cb);
    }

    /// Spawn the child and return its pid once it is live.
    ///
    /// Line readers for both pipes and an exit waiter run in background
    /// tasks for the life of the child. On spawn failure the state reverts
    /// to `Stopped` and an explanatory line lands in the log buffer.
    pub async fn start(self: &Arc<Self>) -> Result<u32, SupervisorError> {
        {
            let mut info = self.info.lock().unwrap();
            if info.state != ProcessState::Stopped {
                return Err(SupervisorError::NotStartable {
                    service: self.spec.name.clone(),
                    state: info.state.to_string(),
                });
            }
            info.state = ProcessState::Starting;
        }

        if self.spec.argv.is_empty() {
            return Err(self.spawn_failed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "argv is empty",
            )));
        }

        self.logbuf
            .write(&format!("[trellis] Starting: {}", self.spec.argv.join(" ")));

        let mut cmd = Command::new(&self.spec.argv[0]);
        cmd.args(&self.spec.argv[1..])
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.spec.work_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.spawn_failed(e)),
        };
        let Some(pid) = child.id() else {
            return Err(self.spawn_failed(std::io::Error::other(
                "child exited before its pid could be read",
            )));
        };

        self.stop_requested.store(false, Ordering::SeqCst);
        self.exit_tx.send_replace(None);
        {
            let mut info = self.info.lock().unwrap();
            info.state = ProcessState::Running;
            info.pid = Some(pid);
            info.started_at = Some(Utc::now());
            info.stopped_at = None;
            info.exit_code = None;
        }

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, self.spec.name.clone(), "stdout", Arc::clone(&self.logbuf));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, self.spec.name.clone(), "stderr", Arc::clone(&self.logbuf));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(service = %this.spec.name, error = %e, "waiting for child failed");
                    -1
                }
            };
            this.logbuf
                .write(&format!("[trellis] Process exited with code {code}"));

            let stop_requested = this.stop_requested.load(Ordering::SeqCst);
            {
                let mut info = this.info.lock().unwrap();
                info.state = if stop_requested || code == 0 {
                    ProcessState::Stopped
                } else {
                    ProcessState::Crashed
                };
                info.stopped_at = Some(Utc::now());
                info.exit_code = Some(code);
            }
            this.exit_tx.send_replace(Some(code));

            // The callback only fires for exits nobody asked for; requested
            // stops are reported synchronously by the stop path.
            if !stop_requested {
                let cb = this.exit_cb.lock().unwrap().take();
                if let Some(cb) = cb {
                    cb(code);
                }
            }
        });

        debug!(service = %self.spec.name, pid, "child spawned");
        Ok(pid)
    }

    /// Request a stop and wait for the child to be reaped.
    ///
    /// Sends the configured stop signal to the process group, waits up to
    /// the spec's stop timeout, then escalates to SIGKILL. Idempotent: a
    /// stop on an already-stopped process succeeds silently.
    pub async fn stop(&self) -> Result<Option<i32>, SupervisorError> {
        let (pid, state, exit_code) = {
            let info = self.info.lock().unwrap();
            (info.pid, info.state, info.exit_code)
        };
        if matches!(state, ProcessState::Stopped | ProcessState::Crashed) {
            return Ok(exit_code);
        }
        let Some(pid) = pid else {
            return Ok(exit_code);
        };

        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut info = self.info.lock().unwrap();
            if matches!(info.state, ProcessState::Running | ProcessState::Starting) {
                info.state = ProcessState::Stopping;
            }
        }

        let mut exit_rx = self.exit_tx.subscribe();

        #[cfg(unix)]
        signal::kill_group(pid, signal::stop_signal(self.spec.stop_signal)).map_err(|e| {
            SupervisorError::Signal {
                service: self.spec.name.clone(),
                message: e.to_string(),
            }
        })?;
        #[cfg(not(unix))]
        return Err(SupervisorError::Signal {
            service: self.spec.name.clone(),
            message: "process-group signalling is only supported on Unix".into(),
        });

        #[cfg(unix)]
        {
            let waited = timeout(self.spec.stop_timeout(), exit_rx.wait_for(Option::is_some))
                .await
                .map(|inner| inner.map(|code| *code));
            match waited {
                Ok(Ok(code)) => Ok(code),
                Ok(Err(_)) => Ok(None),
                Err(_elapsed) => {
                    warn!(
                        service = %self.spec.name,
                        timeout_secs = self.spec.stop_timeout_secs,
                        "stop timeout exceeded, killing process group"
                    );
                    self.logbuf
                        .write("[trellis] Stop timeout exceeded, sending SIGKILL");
                    signal::kill_group(pid, nix::sys::signal::Signal::SIGKILL).map_err(|e| {
                        SupervisorError::Signal {
                            service: self.spec.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    match exit_rx.wait_for(Option::is_some).await {
                        Ok(code) => Ok(*code),
                        Err(_) => Ok(None),
                    }
                }
            }
        }
    }

    /// Send an arbitrary named signal to the process group. TERM, INT and
    /// KILL also mark the stop as requested so the exit counts as clean.
    pub fn signal(&self, name: &str) -> Result<(), SupervisorError> {
        let pid = {
            let info = self.info.lock().unwrap();
            match (info.state, info.pid) {
                (ProcessState::Running | ProcessState::Stopping, Some(pid)) => pid,
                _ => {
                    return Err(SupervisorError::Signal {
                        service: self.spec.name.clone(),
                        message: "process is not running".into(),
                    });
                }
            }
        };
        if signal::is_stop_signal_name(name) {
            self.stop_requested.store(true, Ordering::SeqCst);
        }
        signal::kill_group_by_name(pid, name).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                SupervisorError::UnknownSignal(name.to_string())
            } else {
                SupervisorError::Signal {
                    service: self.spec.name.clone(),
                    message: e.to_string(),
                }
            }
        })
    }

    fn spawn_failed(&self, e: std::io::Error) -> SupervisorError {
        self.logbuf.write(&format!("[trellis] Failed to start: {e}"));
        self.info.lock().unwrap().state = ProcessState::Stopped;
        SupervisorError::Spawn {
            service: self.spec.name.clone(),
            source: e,
        }
    }

    // Log buffer passthrough.

    #[must_use]
    pub fn logs(&self, n: usize) -> Vec<String> {
        self.logbuf.lines(n)
    }

    #[must_use]
    pub fn log_entries(&self, n: usize) -> Vec<Option<Arc<trellis_core::ports::LogEntry>>> {
        self.logbuf.entries(n)
    }

    #[must_use]
    pub fn log_size(&self) -> usize {
        self.logbuf.size()
    }

    #[must_use]
    pub fn log_seq(&self) -> u64 {
        self.logbuf.seq()
    }

    #[must_use]
    pub fn subscribe_logs(&self) -> LogSubscription {
        self.logbuf.subscribe()
    }

    pub fn unsubscribe_logs(&self, id: u64) {
        self.logbuf.unsubscribe(id);
    }

    pub fn clear_logs(&self) {
        self.logbuf.clear();
    }

    /// Close every log subscriber. Called before this process is replaced.
    pub fn close_subscribers(&self) {
        self.logbuf.close_all_subscribers();
    }
}

/// Map an exit status to the recorded exit code. Signalled children record
/// the shell convention of 128+signo.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Read one pipe line-by-line into the log buffer.
///
/// Byte-based with lossy UTF-8 decoding: services built on C toolchains can
/// emit invalid UTF-8, and `lines()` would kill the reader task on the
/// first bad byte.
fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    service: String,
    stream_type: &'static str,
    logbuf: Arc<LogBuffer>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    logbuf.write(&String::from_utf8_lossy(&buf));
                }
                Err(e) => {
                    debug!(service = %service, %stream_type, error = %e, "log reader exiting on read error");
                    break;
                }
            }
        }
        debug!(service = %service, %stream_type, "log reader task exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ServiceSpec {
        ServiceSpec::new(name, vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn fresh_process_reports_stopped() {
        let process = Process::new(sh("noop", "true"));
        assert_eq!(process.state(), ProcessState::Stopped);
        assert!(process.is_fresh());
        assert!(process.info().pid.is_none());
    }

    #[tokio::test]
    async fn empty_argv_fails_without_state_change() {
        let process = Arc::new(Process::new(ServiceSpec::new("empty", vec![])));
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_reverts_to_stopped_and_logs() {
        let process = Arc::new(Process::new(ServiceSpec::new(
            "missing",
            vec!["/nonexistent/definitely-not-a-binary".into()],
        )));
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(process.state(), ProcessState::Stopped);
        let logs = process.logs(10).join("\n");
        assert!(logs.contains("[trellis] Failed to start:"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn clean_exit_records_code_and_sentinels() {
        let process = Arc::new(Process::new(sh("hello", "echo hello")));
        process.start().await.unwrap();
        // Wait for the waiter to record the exit.
        let mut rx = process.exit_tx.subscribe();
        let code = *rx.wait_for(Option::is_some).await.unwrap();
        assert_eq!(code, Some(0));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
        let logs = process.logs(10);
        assert!(logs.iter().any(|l| l.contains("[trellis] Starting:")));
        assert!(logs.iter().any(|l| l == "hello"));
        assert!(logs.iter().any(|l| l.contains("Process exited with code 0")));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn nonzero_exit_without_stop_request_is_crashed() {
        let process = Arc::new(Process::new(sh("fail", "exit 3")));
        let (tx, rx) = tokio::sync::oneshot::channel();
        process.set_exit_callback(Box::new(move |code| {
            let _ = tx.send(code);
        }));
        process.start().await.unwrap();
        let code = rx.await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(process.state(), ProcessState::Crashed);
        assert_eq!(process.info().exit_code, Some(3));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_is_clean_and_idempotent() {
        let process = Arc::new(Process::new(sh("sleeper", "sleep 30")));
        let (tx, mut rx) = tokio::sync::oneshot::channel::<i32>();
        process.set_exit_callback(Box::new(move |code| {
            let _ = tx.send(code);
        }));
        process.start().await.unwrap();
        assert_eq!(process.state(), ProcessState::Running);

        let code = process.stop().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
        // sh killed by SIGTERM records 128+15.
        assert_eq!(code, Some(143));
        // Requested stop: the exit callback must not have fired.
        assert!(rx.try_recv().is_err());

        // Second stop succeeds silently.
        let again = process.stop().await.unwrap();
        assert_eq!(again, Some(143));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_kills_the_whole_group() {
        // The child spawns a grandchild sleep; group signalling reaps both.
        let process = Arc::new(Process::new(sh("group", "sleep 30 & wait")));
        process.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        process.stop().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }
}
