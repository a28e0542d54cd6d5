//! The service supervisor.
//!
//! Owns the set of managed services, enforces per-service dependency
//! ordering, implements the restart policy, and publishes lifecycle events
//! through the `EventBus` port. Runtime exits are never surfaced to callers
//! synchronously; they show up as state transitions, events, and the
//! restart machinery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trellis_core::config::{RestartPolicy, ServiceSpec};
use trellis_core::error::SupervisorError;
use trellis_core::events::{RestartTrigger, SupervisorEvent};
use trellis_core::ports::{EventBus, LogEntry};

use crate::crash;
use crate::logbuf::LogSubscription;
use crate::process::{ExitCallback, Process, ProcessState};

/// How many trailing log lines feed the crash analyzer.
const CRASH_LOG_WINDOW: usize = 50;

/// Read-only view of one service, as returned by `status` and `list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub enabled: bool,
    pub watching: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_parser: Option<String>,
}

/// Restart policy captured when the exit callback is installed, so a later
/// `update_configs` cannot change what happens to the running child.
#[derive(Debug, Clone, Copy)]
struct PolicySnapshot {
    policy: RestartPolicy,
    max_restarts: u32,
    restart_delay: Duration,
}

struct ManagedService {
    spec: ServiceSpec,
    process: Arc<Process>,
    restart_count: u32,
    enabled: bool,
    restart_timer: Option<JoinHandle<()>>,
}

impl ManagedService {
    fn new(spec: ServiceSpec) -> Self {
        let enabled = spec.enabled;
        Self {
            process: Arc::new(Process::new(spec.clone())),
            spec,
            restart_count: 0,
            enabled,
            restart_timer: None,
        }
    }

    fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }
}

type StoppingTracker = Arc<StdMutex<HashSet<String>>>;

/// Lifecycle engine for the configured set of services.
pub struct ServiceSupervisor {
    services: RwLock<HashMap<String, ManagedService>>,
    bus: Arc<dyn EventBus>,
    weak: Weak<Self>,
}

impl ServiceSupervisor {
    /// Build the supervisor from already-expanded specs. Nothing is started.
    #[must_use]
    pub fn new(specs: Vec<ServiceSpec>, bus: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let mut services = HashMap::new();
            for spec in specs {
                if services.contains_key(&spec.name) {
                    warn!(service = %spec.name, "duplicate service name, keeping the last definition");
                }
                services.insert(spec.name.clone(), ManagedService::new(spec));
            }
            Self {
                services: RwLock::new(services),
                bus,
                weak: weak.clone(),
            }
        })
    }

    /// Start a service and, recursively, its dependencies.
    ///
    /// Idempotent on a running service. Disabled dependencies are skipped;
    /// missing ones fail; a cycle in the dependency graph fails before
    /// anything is spawned.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let mut visiting = HashSet::new();
        self.start_inner(name, &mut visiting, false).await
    }

    fn start_inner<'a>(
        &'a self,
        name: &'a str,
        visiting: &'a mut HashSet<String>,
        suppress_started: bool,
    ) -> BoxFuture<'a, Result<(), SupervisorError>> {
        async move {
            // Snapshot policy and dependencies under the lock; the snapshot
            // rides with the exit callback so in-flight restart decisions
            // survive a concurrent update_configs.
            let (snapshot, deps) = {
                let mut services = self.services.write().await;
                let Some(ms) = services.get_mut(name) else {
                    return Err(SupervisorError::ServiceNotFound(name.to_string()));
                };
                if ms.process.state() == ProcessState::Running {
                    return Ok(());
                }
                // Revisiting a not-yet-running service within one traversal
                // means the graph loops. Already-running services returned
                // above, so shared (diamond) dependencies pass through.
                if !visiting.insert(name.to_string()) {
                    return Err(SupervisorError::DependencyCycle(name.to_string()));
                }
                ms.cancel_restart_timer();
                let snapshot = PolicySnapshot {
                    policy: ms.spec.restart_policy,
                    max_restarts: ms.spec.max_restarts,
                    restart_delay: ms.spec.restart_delay(),
                };
                (snapshot, ms.spec.depends_on.clone())
            };

            for dep in &deps {
                let dep_enabled = {
                    let services = self.services.read().await;
                    match services.get(dep) {
                        None => {
                            return Err(SupervisorError::DependencyNotFound {
                                service: name.to_string(),
                                dependency: dep.clone(),
                            });
                        }
                        Some(d) => d.enabled,
                    }
                };
                if !dep_enabled {
                    debug!(service = %name, dependency = %dep, "dependency disabled, skipping");
                    continue;
                }
                self.start_inner(dep, visiting, false).await?;
            }

            // A process that has run before is replaced with a fresh one;
            // its old log subscribers are released first.
            let process = {
                let mut services = self.services.write().await;
                let Some(ms) = services.get_mut(name) else {
                    return Err(SupervisorError::ServiceNotFound(name.to_string()));
                };
                if ms.process.state() == ProcessState::Running {
                    return Ok(());
                }
                if !ms.process.is_fresh() {
                    ms.process.close_subscribers();
                    ms.process = Arc::new(Process::new(ms.spec.clone()));
                }
                let process = Arc::clone(&ms.process);
                process.set_exit_callback(self.make_exit_callback(
                    name.to_string(),
                    snapshot,
                    Arc::clone(&process),
                ));
                process
            };

            let pid = process.start().await?;
            info!(service = %name, pid, "service started");
            if !suppress_started {
                self.bus.publish(SupervisorEvent::Started {
                    service: name.to_string(),
                    pid,
                });
            }
            Ok(())
        }
        .boxed()
    }

    /// Stop a service, stopping its running dependents first.
    ///
    /// Idempotent on a stopped service: success, no event.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let tracker: StoppingTracker = Arc::new(StdMutex::new(HashSet::new()));
        self.stop_inner(name, &tracker).await
    }

    fn stop_inner<'a>(
        &'a self,
        name: &'a str,
        tracker: &'a StoppingTracker,
    ) -> BoxFuture<'a, Result<(), SupervisorError>> {
        async move {
            if tracker.lock().unwrap().contains(name) {
                return Ok(());
            }

            let (process, was_running, dependents) = {
                let mut services = self.services.write().await;
                let (process, was_running) = match services.get_mut(name) {
                    None => return Err(SupervisorError::ServiceNotFound(name.to_string())),
                    Some(ms) => {
                        ms.cancel_restart_timer();
                        let was_running = matches!(
                            ms.process.state(),
                            ProcessState::Running | ProcessState::Starting
                        );
                        (Arc::clone(&ms.process), was_running)
                    }
                };
                let dependents: Vec<String> = services
                    .iter()
                    .filter(|(dep_name, m)| {
                        dep_name.as_str() != name
                            && m.spec.depends_on.iter().any(|d| d == name)
                            && matches!(
                                m.process.state(),
                                ProcessState::Running | ProcessState::Starting
                            )
                    })
                    .map(|(n, _)| n.clone())
                    .collect();
                (process, was_running, dependents)
            };

            // Dependents go down first; their first error aborts the walk
            // without stopping this service.
            for dependent in dependents {
                self.stop_inner(&dependent, tracker).await?;
            }

            if !tracker.lock().unwrap().insert(name.to_string()) {
                return Ok(());
            }

            let exit_code = process.stop().await?;
            if was_running {
                info!(service = %name, exit_code = ?exit_code, "service stopped");
                self.bus.publish(SupervisorEvent::Stopped {
                    service: name.to_string(),
                    exit_code: exit_code.unwrap_or(0),
                });
            }
            Ok(())
        }
        .boxed()
    }

    /// Stop (if needed) and start a service again.
    pub async fn restart(
        &self,
        name: &str,
        trigger: RestartTrigger,
    ) -> Result<(), SupervisorError> {
        let state = {
            let services = self.services.read().await;
            let Some(ms) = services.get(name) else {
                return Err(SupervisorError::ServiceNotFound(name.to_string()));
            };
            ms.process.state()
        };
        if matches!(state, ProcessState::Running | ProcessState::Starting) {
            self.stop(name).await?;
        }

        if trigger == RestartTrigger::Manual {
            let mut services = self.services.write().await;
            if let Some(ms) = services.get_mut(name) {
                ms.restart_count = 0;
            }
        }

        let mut visiting = HashSet::new();
        self.start_inner(name, &mut visiting, true).await?;
        self.bus.publish(SupervisorEvent::Restarted {
            service: name.to_string(),
            trigger,
        });
        Ok(())
    }

    /// Start every enabled service in dependency order.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        self.start_bulk(false).await
    }

    /// Start every enabled service with `watching = true`.
    pub async fn start_watched(&self) -> Result<(), SupervisorError> {
        self.start_bulk(true).await
    }

    async fn start_bulk(&self, watched_only: bool) -> Result<(), SupervisorError> {
        let graph: Vec<(String, Vec<String>)> = {
            let services = self.services.read().await;
            let mut graph: Vec<_> = services
                .iter()
                .filter(|(_, m)| m.enabled && (!watched_only || m.spec.watching))
                .map(|(n, m)| (n.clone(), m.spec.depends_on.clone()))
                .collect();
            graph.sort_by(|a, b| a.0.cmp(&b.0));
            graph
        };

        let mut results = Vec::with_capacity(graph.len());
        for name in start_order(&graph) {
            results.push(self.start(&name).await);
        }
        aggregate(results)
    }

    /// Stop every running service, in parallel.
    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        self.stop_bulk(false).await
    }

    /// Stop every running service with `watching = true`, in parallel.
    pub async fn stop_watched(&self) -> Result<(), SupervisorError> {
        self.stop_bulk(true).await
    }

    async fn stop_bulk(&self, watched_only: bool) -> Result<(), SupervisorError> {
        let names: Vec<String> = {
            let services = self.services.read().await;
            services
                .iter()
                .filter(|(_, m)| {
                    (!watched_only || m.spec.watching)
                        && matches!(
                            m.process.state(),
                            ProcessState::Running | ProcessState::Starting
                        )
                })
                .map(|(n, _)| n.clone())
                .collect()
        };

        // One shared tracker keeps racing recursions through a common
        // dependent from stopping the same process twice.
        let tracker: StoppingTracker = Arc::new(StdMutex::new(HashSet::new()));
        let results = join_all(names.iter().map(|n| self.stop_inner(n, &tracker))).await;
        aggregate(results)
    }

    /// Read-only view of one service.
    pub async fn status(&self, name: &str) -> Result<ServiceStatus, SupervisorError> {
        let services = self.services.read().await;
        services
            .get(name)
            .map(status_of)
            .ok_or_else(|| SupervisorError::ServiceNotFound(name.to_string()))
    }

    /// Read-only view of every service, sorted by name.
    pub async fn list(&self) -> Vec<ServiceStatus> {
        let services = self.services.read().await;
        let mut all: Vec<_> = services.values().map(status_of).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Send a named signal to a service's process group.
    pub async fn signal(&self, name: &str, signal_name: &str) -> Result<(), SupervisorError> {
        self.process_of(name).await?.signal(signal_name)
    }

    /// Last `n` raw log lines.
    pub async fn logs(&self, name: &str, n: usize) -> Result<Vec<String>, SupervisorError> {
        Ok(self.process_of(name).await?.logs(n))
    }

    /// Last `n` parsed log entries; unparsed lines yield `None`.
    pub async fn parsed_logs(
        &self,
        name: &str,
        n: usize,
    ) -> Result<Vec<Option<Arc<LogEntry>>>, SupervisorError> {
        Ok(self.process_of(name).await?.log_entries(n))
    }

    pub async fn clear_logs(&self, name: &str) -> Result<(), SupervisorError> {
        self.process_of(name).await?.clear_logs();
        Ok(())
    }

    pub async fn log_size(&self, name: &str) -> Result<usize, SupervisorError> {
        Ok(self.process_of(name).await?.log_size())
    }

    /// Subscribe to a service's live log stream.
    pub async fn subscribe_logs(&self, name: &str) -> Result<LogSubscription, SupervisorError> {
        Ok(self.process_of(name).await?.subscribe_logs())
    }

    pub async fn unsubscribe_logs(&self, name: &str, id: u64) -> Result<(), SupervisorError> {
        self.process_of(name).await?.unsubscribe_logs(id);
        Ok(())
    }

    /// Live reconfiguration. Existing entries get a fresh process (old log
    /// subscribers closed, restart count reset, enabled flag refreshed);
    /// new entries are inserted; entries missing from `new_specs` are
    /// removed. Stopping affected services first is the caller's job.
    pub async fn update_configs(&self, new_specs: Vec<ServiceSpec>) {
        let mut services = self.services.write().await;
        let mut keep: HashSet<String> = HashSet::with_capacity(new_specs.len());
        for spec in new_specs {
            keep.insert(spec.name.clone());
            match services.get_mut(&spec.name) {
                Some(ms) => {
                    ms.cancel_restart_timer();
                    ms.process.close_subscribers();
                    ms.process = Arc::new(Process::new(spec.clone()));
                    ms.restart_count = 0;
                    ms.enabled = spec.enabled;
                    ms.spec = spec;
                }
                None => {
                    services.insert(spec.name.clone(), ManagedService::new(spec));
                }
            }
        }
        services.retain(|name, ms| {
            if keep.contains(name) {
                true
            } else {
                debug!(service = %name, "removing service dropped from configuration");
                ms.cancel_restart_timer();
                ms.process.close_subscribers();
                false
            }
        });
    }

    async fn process_of(&self, name: &str) -> Result<Arc<Process>, SupervisorError> {
        let services = self.services.read().await;
        services
            .get(name)
            .map(|ms| Arc::clone(&ms.process))
            .ok_or_else(|| SupervisorError::ServiceNotFound(name.to_string()))
    }

    fn make_exit_callback(
        &self,
        name: String,
        snapshot: PolicySnapshot,
        process: Arc<Process>,
    ) -> ExitCallback {
        let weak = self.weak.clone();
        Box::new(move |exit_code| {
            if let Some(sup) = weak.upgrade() {
                tokio::spawn(async move {
                    sup.handle_unexpected_exit(&name, exit_code, snapshot, &process)
                        .await;
                });
            }
        })
    }

    /// Fires when a process nobody asked to stop exits.
    async fn handle_unexpected_exit(
        &self,
        name: &str,
        exit_code: i32,
        snapshot: PolicySnapshot,
        exited: &Arc<Process>,
    ) {
        let should_restart = {
            let mut services = self.services.write().await;
            let Some(ms) = services.get_mut(name) else {
                debug!(service = %name, "exited service no longer managed, ignoring");
                return;
            };
            if !Arc::ptr_eq(&ms.process, exited) {
                debug!(service = %name, "process was replaced, ignoring stale exit");
                return;
            }
            let should_restart = match snapshot.policy {
                RestartPolicy::Always => ms.restart_count < snapshot.max_restarts,
                RestartPolicy::OnFailure => {
                    exit_code != 0 && ms.restart_count < snapshot.max_restarts
                }
                RestartPolicy::Never => false,
            };
            if should_restart {
                ms.restart_count += 1;
            }
            should_restart
        };

        // Exactly one terminal event per exit: crashed for non-zero codes,
        // stopped otherwise. The log snapshot comes from the process that
        // exited, not any replacement installed since.
        if exit_code == 0 {
            info!(service = %name, "service exited cleanly");
            self.bus.publish(SupervisorEvent::Stopped {
                service: name.to_string(),
                exit_code,
            });
        } else {
            let lines = exited.logs(CRASH_LOG_WINDOW);
            let result = crash::analyze(&lines, exit_code);
            warn!(
                service = %name,
                exit_code,
                reason = %result.reason,
                details = %result.details,
                "service crashed"
            );
            self.bus.publish(SupervisorEvent::Crashed {
                service: name.to_string(),
                exit_code,
                reason: result.reason,
                details: result.details,
            });
        }

        if should_restart {
            self.schedule_restart(name, snapshot.restart_delay).await;
        }
    }

    /// Arm the restart timer. At most one is pending per service; any
    /// existing one is cancelled before the new one is installed.
    async fn schedule_restart(&self, name: &str, delay: Duration) {
        let weak = self.weak.clone();
        let timer_name = name.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(sup) = weak.upgrade() else { return };
            // Clear our own handle first so the restart below doesn't abort
            // the very task performing it, then re-check the service still
            // exists and is enabled.
            let proceed = {
                let mut services = sup.services.write().await;
                match services.get_mut(&timer_name) {
                    Some(ms) => {
                        ms.restart_timer = None;
                        ms.enabled
                    }
                    None => false,
                }
            };
            if proceed {
                debug!(service = %timer_name, "restart timer fired");
                if let Err(e) = sup.restart(&timer_name, RestartTrigger::Crash).await {
                    warn!(service = %timer_name, error = %e, "scheduled restart failed");
                }
            }
        });

        let mut services = self.services.write().await;
        if let Some(ms) = services.get_mut(name) {
            ms.cancel_restart_timer();
            ms.restart_timer = Some(timer);
        } else {
            timer.abort();
        }
    }
}

fn status_of(ms: &ManagedService) -> ServiceStatus {
    let info = ms.process.info();
    ServiceStatus {
        name: ms.spec.name.clone(),
        state: info.state,
        pid: info.pid,
        started_at: info.started_at,
        stopped_at: info.stopped_at,
        exit_code: info.exit_code,
        restart_count: ms.restart_count,
        enabled: ms.enabled,
        watching: ms.spec.watching,
        log_parser: ms.spec.log_parser.clone(),
    }
}

fn aggregate(results: Vec<Result<(), SupervisorError>>) -> Result<(), SupervisorError> {
    let mut errors = results.into_iter().filter_map(Result::err);
    let Some(first) = errors.next() else {
        return Ok(());
    };
    let rest: Vec<_> = errors.collect();
    for e in &rest {
        warn!(error = %e, "additional batch failure");
    }
    Err(SupervisorError::Batch {
        count: 1 + rest.len(),
        first: Box::new(first),
    })
}

/// Topological start order with a fixed-point fallback.
///
/// A service is ready once all of its in-set dependencies are scheduled.
/// When a pass makes no progress (cycle or dependency outside the set) the
/// remainder is scheduled in arbitrary order: a misconfigured graph
/// degrades instead of refusing to run.
fn start_order(graph: &[(String, Vec<String>)]) -> Vec<String> {
    let in_set: HashSet<&str> = graph.iter().map(|(n, _)| n.as_str()).collect();
    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(graph.len());

    while order.len() < graph.len() {
        let mut progressed = false;
        for (name, deps) in graph {
            if scheduled.contains(name.as_str()) {
                continue;
            }
            let ready = deps
                .iter()
                .all(|d| !in_set.contains(d.as_str()) || scheduled.contains(d.as_str()));
            if ready {
                scheduled.insert(name);
                order.push(name.clone());
                progressed = true;
            }
        }
        if !progressed {
            for (name, _) in graph {
                if !scheduled.contains(name.as_str()) {
                    warn!(service = %name, "no dependency order found, scheduling anyway");
                    order.push(name.clone());
                    scheduled.insert(name);
                }
            }
        }
    }
    order
}
