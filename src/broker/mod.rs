//! The broker core: registry, emulator lifecycle, and start coordination.

pub mod error;
pub mod expand;
pub mod ports;
pub mod proxy;
pub mod resolver;

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill as send_unix_signal},
    unistd::Pid,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    time::{Instant, timeout, timeout_at},
};

use error::{BrokerError, BrokerResult};
use expand::expand_command;
use ports::{PortPicker, PortRange};
use proxy::ProxyRecord;

use crate::state::{
    CommandLine, EmulatorRecord, EmulatorState, ProcessHandle, Readiness, RuleRecord, StartOutcome,
};

/// How long a stopped child may linger after SIGINT before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Environment variable naming the broker endpoint for child processes.
pub const BROKER_ADDRESS_ENV: &str = "TESTENV_BROKER_ADDRESS";

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-]+$").expect("valid id regex"));

/// A resolve rule as submitted and returned over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule_id: String,
    #[serde(default)]
    pub target_patterns: Vec<String>,
    #[serde(default)]
    pub resolved_host: String,
    #[serde(default)]
    pub requires_secure_connection: bool,
}

/// An emulator definition as submitted by `CreateEmulator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorSpec {
    pub emulator_id: String,
    pub rule: RuleSpec,
    pub start_command: CommandLine,
    #[serde(default)]
    pub start_on_demand: bool,
}

/// Snapshot of an emulator returned by `GetEmulator` / `ListEmulators`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorView {
    pub emulator_id: String,
    pub state: EmulatorState,
    pub start_on_demand: bool,
    pub rule: RuleSpec,
    pub start_command: CommandLine,
    pub expanded_command: Option<CommandLine>,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyView {
    pub emulator_id: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Address handed to children via `TESTENV_BROKER_ADDRESS`.
    pub broker_address: String,
    pub port_ranges: Vec<PortRange>,
    pub default_start_deadline: Option<Duration>,
}

/// Central broker state. One mutex guards map membership and record
/// transitions; it is never held across spawn, wait, or network I/O.
#[derive(Debug)]
pub struct Broker {
    inner: Mutex<Inner>,
    ports: PortPicker,
    broker_dir: PathBuf,
    broker_address: String,
    default_start_deadline: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    emulators: HashMap<String, EmulatorRecord>,
    rules: BTreeMap<String, RuleRecord>,
    proxies: HashMap<String, ProxyRecord>,
}

#[derive(Debug, Default)]
struct OfflineCleanup {
    pid: Option<u32>,
    ports: HashMap<String, u16>,
}

impl Inner {
    fn insert_rule(&mut self, rule: RuleRecord) -> BrokerResult<()> {
        match self.rules.get(&rule.rule_id) {
            Some(existing) => {
                if existing.same_definition(
                    &rule.target_patterns,
                    &rule.resolved_host,
                    rule.requires_secure_connection,
                ) {
                    // Re-creating an identical rule is a no-op.
                    Ok(())
                } else {
                    Err(BrokerError::AlreadyExists(format!(
                        "a different rule {:?} already exists",
                        rule.rule_id
                    )))
                }
            }
            None => {
                self.rules.insert(rule.rule_id.clone(), rule);
                Ok(())
            }
        }
    }

    /// Drive a record to OFFLINE, clearing the rule's resolved host and
    /// handing the leased ports back to the caller for release.
    fn take_offline(&mut self, emulator_id: &str) -> OfflineCleanup {
        let Some(record) = self.emulators.get_mut(emulator_id) else {
            return OfflineCleanup::default();
        };
        let pid = record.pid;
        let rule_id = record.rule_id.clone();
        let ports = record.reset_offline();
        if let Some(rule) = self.rules.get_mut(&rule_id) {
            rule.resolved_host.clear();
        }
        OfflineCleanup { pid, ports }
    }

    /// `take_offline` guarded by the start-cycle generation, so stale
    /// observers cannot tear down a newer cycle.
    fn cleanup_if_current(&mut self, emulator_id: &str, generation: u64) -> Option<OfflineCleanup> {
        let record = self.emulators.get(emulator_id)?;
        if record.generation != generation || record.state == EmulatorState::Offline {
            return None;
        }
        Some(self.take_offline(emulator_id))
    }
}

enum StartPlan {
    Join {
        readiness: Arc<Readiness>,
        generation: u64,
        deadline: Option<Instant>,
    },
    Launch {
        readiness: Arc<Readiness>,
        generation: u64,
        command: CommandLine,
    },
}

impl Broker {
    pub fn new(options: BrokerOptions) -> BrokerResult<Self> {
        let ports = PortPicker::new(options.port_ranges)?;
        let broker_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            ports,
            broker_dir,
            broker_address: options.broker_address,
            default_start_deadline: options.default_start_deadline,
        })
    }

    pub fn create_emulator(&self, spec: EmulatorSpec) -> BrokerResult<()> {
        validate_id("emulator", &spec.emulator_id)?;
        validate_id("rule", &spec.rule.rule_id)?;
        if spec.start_command.path.is_empty() {
            return Err(BrokerError::InvalidArgument(format!(
                "emulator {:?} is missing a start command",
                spec.emulator_id
            )));
        }
        let rule = RuleRecord::new(
            spec.rule.rule_id.clone(),
            spec.rule.target_patterns,
            spec.rule.resolved_host,
            spec.rule.requires_secure_connection,
        )?;

        let mut inner = self.inner.lock();
        if inner.emulators.contains_key(&spec.emulator_id) {
            return Err(BrokerError::AlreadyExists(format!(
                "emulator {:?} already exists",
                spec.emulator_id
            )));
        }
        inner.insert_rule(rule)?;
        inner.emulators.insert(
            spec.emulator_id.clone(),
            EmulatorRecord::new(
                spec.emulator_id,
                spec.rule.rule_id,
                spec.start_command,
                spec.start_on_demand,
            ),
        );
        Ok(())
    }

    pub fn get_emulator(&self, emulator_id: &str) -> BrokerResult<EmulatorView> {
        let inner = self.inner.lock();
        let record = inner
            .emulators
            .get(emulator_id)
            .ok_or_else(|| emulator_not_found(emulator_id))?;
        Ok(emulator_view(&inner, record))
    }

    pub fn list_emulators(&self) -> Vec<EmulatorView> {
        let inner = self.inner.lock();
        let mut views: Vec<EmulatorView> = inner
            .emulators
            .values()
            .map(|record| emulator_view(&inner, record))
            .collect();
        views.sort_by(|a, b| a.emulator_id.cmp(&b.emulator_id));
        views
    }

    /// Remove an emulator, driving it through stop first when it is not
    /// OFFLINE. Its rule stays behind as a standalone rule.
    pub async fn delete_emulator(&self, emulator_id: &str) -> BrokerResult<()> {
        self.stop_emulator(emulator_id).await?;
        let mut inner = self.inner.lock();
        inner
            .emulators
            .remove(emulator_id)
            .ok_or_else(|| emulator_not_found(emulator_id))?;
        Ok(())
    }

    pub fn create_resolve_rule(&self, spec: RuleSpec) -> BrokerResult<()> {
        validate_id("rule", &spec.rule_id)?;
        let rule = RuleRecord::new(
            spec.rule_id,
            spec.target_patterns,
            spec.resolved_host,
            spec.requires_secure_connection,
        )?;
        self.inner.lock().insert_rule(rule)
    }

    pub fn get_resolve_rule(&self, rule_id: &str) -> BrokerResult<RuleSpec> {
        let inner = self.inner.lock();
        inner
            .rules
            .get(rule_id)
            .map(rule_spec)
            .ok_or_else(|| rule_not_found(rule_id))
    }

    /// Merge the submitted patterns into the rule and overwrite its scalar
    /// fields. Returns the stored rule after the update.
    pub fn update_resolve_rule(&self, spec: RuleSpec) -> BrokerResult<RuleSpec> {
        let mut inner = self.inner.lock();
        let rule = inner
            .rules
            .get_mut(&spec.rule_id)
            .ok_or_else(|| rule_not_found(&spec.rule_id))?;
        rule.merge_patterns(&spec.target_patterns)?;
        rule.resolved_host = spec.resolved_host;
        rule.requires_secure_connection = spec.requires_secure_connection;
        Ok(rule_spec(rule))
    }

    pub fn list_resolve_rules(&self) -> Vec<RuleSpec> {
        self.inner.lock().rules.values().map(rule_spec).collect()
    }

    /// Callback from an emulator child that has finished coming up.
    pub fn report_emulator_online(
        &self,
        emulator_id: &str,
        resolved_host: String,
        target_patterns: Vec<String>,
    ) -> BrokerResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .emulators
            .get(emulator_id)
            .ok_or_else(|| emulator_not_found(emulator_id))?;
        if record.state != EmulatorState::Starting {
            return Err(BrokerError::FailedPrecondition(format!(
                "emulator {emulator_id:?} is {} but must be STARTING to report online",
                record.state
            )));
        }
        let rule_id = record.rule_id.clone();

        let rule = inner.rules.get_mut(&rule_id).ok_or_else(|| {
            BrokerError::FailedPrecondition(format!(
                "emulator {emulator_id:?} references the missing rule {rule_id:?}"
            ))
        })?;
        rule.merge_patterns(&target_patterns)?;
        rule.resolved_host = resolved_host.clone();

        let record = inner
            .emulators
            .get_mut(emulator_id)
            .expect("record observed under the same lock");
        record.state = EmulatorState::Online;
        if let Some(readiness) = record.readiness.clone() {
            readiness.fire(Ok(()));
        }
        tracing::info!(emulator = emulator_id, host = %resolved_host, "emulator online");
        Ok(())
    }

    /// Start an emulator and wait until it reports online or the deadline
    /// elapses. Concurrent callers for the same emulator collapse onto one
    /// child and receive the same outcome.
    pub async fn start_emulator(
        self: &Arc<Self>,
        emulator_id: &str,
        caller_deadline: Option<Instant>,
    ) -> BrokerResult<()> {
        let deadline = self.effective_deadline(caller_deadline);

        let plan = {
            let mut inner = self.inner.lock();
            let record = inner
                .emulators
                .get_mut(emulator_id)
                .ok_or_else(|| emulator_not_found(emulator_id))?;
            match record.state {
                EmulatorState::Online => {
                    return Err(BrokerError::AlreadyExists(format!(
                        "emulator {emulator_id:?} is already online"
                    )));
                }
                EmulatorState::Starting => StartPlan::Join {
                    readiness: record
                        .readiness
                        .clone()
                        .expect("a STARTING record always carries a readiness signal"),
                    generation: record.generation,
                    deadline: record.start_deadline,
                },
                EmulatorState::Offline => {
                    let readiness = record.begin_start(deadline);
                    StartPlan::Launch {
                        readiness,
                        generation: record.generation,
                        command: record.start_command.clone(),
                    }
                }
            }
        };

        match plan {
            StartPlan::Join {
                readiness,
                generation,
                deadline,
            } => {
                self.await_start(emulator_id, generation, &readiness, deadline)
                    .await
            }
            StartPlan::Launch {
                readiness,
                generation,
                command,
            } => {
                if let Err(error) = self.launch(emulator_id, generation, command).await {
                    let cleanup = {
                        let mut inner = self.inner.lock();
                        inner.cleanup_if_current(emulator_id, generation)
                    };
                    if let Some(cleanup) = cleanup {
                        self.ports.release_all(cleanup.ports.into_values());
                    }
                    readiness.fire(Err(error.clone()));
                    return Err(error);
                }
                self.await_start(emulator_id, generation, &readiness, deadline)
                    .await
            }
        }
    }

    /// Stop an emulator. OFFLINE is a success no-op; otherwise the child is
    /// interrupted and force-terminated if it lingers.
    pub async fn stop_emulator(&self, emulator_id: &str) -> BrokerResult<()> {
        let (process, cleanup) = {
            let mut inner = self.inner.lock();
            let record = inner
                .emulators
                .get(emulator_id)
                .ok_or_else(|| emulator_not_found(emulator_id))?;
            if record.state == EmulatorState::Offline {
                return Ok(());
            }
            if record.state == EmulatorState::Starting {
                if let Some(readiness) = record.readiness.clone() {
                    readiness.fire(Err(BrokerError::Aborted(format!(
                        "emulator {emulator_id:?} was stopped while starting"
                    ))));
                }
            }
            let process = record.process.clone();
            let cleanup = inner.take_offline(emulator_id);
            (process, cleanup)
        };

        self.ports.release_all(cleanup.ports.into_values());
        if let Some(pid) = cleanup.pid {
            terminate_child(emulator_id, pid, process).await;
        }
        tracing::info!(emulator = emulator_id, "emulator stopped");
        Ok(())
    }

    /// Stop every emulator and drop every proxy; called at broker shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        for record in self.drain_proxies() {
            record.stop().await;
        }
        let ids: Vec<String> = self.inner.lock().emulators.keys().cloned().collect();
        for id in ids {
            if let Err(error) = self.stop_emulator(&id).await {
                tracing::warn!(%error, emulator = %id, "failed to stop emulator during shutdown");
            }
        }
    }

    fn effective_deadline(&self, caller_deadline: Option<Instant>) -> Option<Instant> {
        let default = self
            .default_start_deadline
            .map(|limit| Instant::now() + limit);
        match (caller_deadline, default) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Expand, spawn, and register the child for one start cycle. Failures
    /// are collapsed into `Aborted` for the caller and logged verbatim.
    async fn launch(
        self: &Arc<Self>,
        emulator_id: &str,
        generation: u64,
        command: CommandLine,
    ) -> BrokerResult<()> {
        let expansion =
            expand_command(&command, &self.broker_dir, &self.ports).map_err(|error| {
                tracing::error!(%error, emulator = emulator_id, "expanding start command failed");
                BrokerError::Aborted(format!("starting emulator {emulator_id:?} failed: {error}"))
            })?;

        let mut launch = Command::new(&expansion.command.path);
        launch.args(&expansion.command.args);
        launch.env(BROKER_ADDRESS_ENV, &self.broker_address);
        launch.stdout(Stdio::piped());
        launch.stderr(Stdio::piped());
        launch.stdin(Stdio::null());

        let mut child = match launch.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(%error, emulator = emulator_id, command = %expansion.command.path, "spawning emulator failed");
                self.ports.release_all(expansion.ports.into_values());
                return Err(BrokerError::Aborted(format!(
                    "starting emulator {emulator_id:?} failed: {error}"
                )));
            }
        };
        let pid = child.id();
        tracing::info!(emulator = emulator_id, pid = ?pid, command = %expansion.command.path, "emulator starting");

        if let Some(stdout) = child.stdout.take() {
            spawn_output_prefixer(emulator_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_prefixer(emulator_id.to_string(), "stderr", stderr);
        }

        let process = Arc::new(ProcessHandle::new());
        // The record may already be ONLINE here if the child reported in
        // before this registration; only a torn-down cycle supersedes us.
        let superseded = {
            let mut inner = self.inner.lock();
            match inner.emulators.get_mut(emulator_id) {
                Some(record)
                    if record.generation == generation
                        && record.state != EmulatorState::Offline =>
                {
                    record.pid = pid;
                    record.expanded_command = Some(expansion.command.clone());
                    record.leased_ports = expansion.ports.clone();
                    record.process = Some(process.clone());
                    false
                }
                _ => true,
            }
        };
        if superseded {
            // Stopped or deleted while we were spawning; reap the orphan.
            tracing::warn!(emulator = emulator_id, "start superseded before child registration");
            let _ = child.start_kill();
            self.ports.release_all(expansion.ports.into_values());
        }

        let broker = Arc::clone(self);
        let id = emulator_id.to_string();
        tokio::spawn(async move {
            let described = match child.wait().await {
                Ok(status) => exit_message(&status),
                Err(error) => format!("wait failed: {error}"),
            };
            process.signal_exit();
            if !superseded {
                broker.observe_child_exit(&id, generation, &described);
            }
        });
        Ok(())
    }

    async fn await_start(
        &self,
        emulator_id: &str,
        generation: u64,
        readiness: &Readiness,
        deadline: Option<Instant>,
    ) -> BrokerResult<()> {
        match deadline {
            Some(deadline) => match timeout_at(deadline, readiness.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => self.expire_start(emulator_id, generation, readiness),
            },
            None => readiness.wait().await,
        }
    }

    /// The start deadline elapsed for this waiter. The first writer to the
    /// readiness signal tears the cycle down; a losing writer adopts
    /// whatever outcome was recorded first.
    fn expire_start(
        &self,
        emulator_id: &str,
        generation: u64,
        readiness: &Readiness,
    ) -> StartOutcome {
        let error = BrokerError::DeadlineExceeded(format!(
            "emulator {emulator_id:?} did not report online before the start deadline"
        ));
        // Fire and tear down under one registry lock so a racing
        // ReportEmulatorOnline observes either STARTING or OFFLINE, never
        // a half-expired cycle.
        let cleanup = {
            let mut inner = self.inner.lock();
            if !readiness.fire(Err(error.clone())) {
                return readiness
                    .outcome()
                    .expect("outcome recorded by the winning writer");
            }
            inner.cleanup_if_current(emulator_id, generation)
        };
        if let Some(cleanup) = cleanup {
            self.ports.release_all(cleanup.ports.into_values());
            if let Some(pid) = cleanup.pid {
                if let Err(error) = signal_process(pid, Signal::SIGINT) {
                    tracing::warn!(%error, emulator = emulator_id, "failed to interrupt child after deadline");
                }
            }
        }
        tracing::error!(emulator = emulator_id, "start deadline exceeded");
        Err(error)
    }

    /// Invoked by the per-child wait task when the process exits.
    fn observe_child_exit(&self, emulator_id: &str, generation: u64, described: &str) {
        let (was, cleanup) = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.emulators.get(emulator_id) else {
                return;
            };
            if record.generation != generation || record.state == EmulatorState::Offline {
                return;
            }
            let was = record.state;
            if was == EmulatorState::Starting {
                if let Some(readiness) = record.readiness.clone() {
                    readiness.fire(Err(BrokerError::Aborted(format!(
                        "emulator {emulator_id:?} {described} before reporting online"
                    ))));
                }
            }
            (was, inner.take_offline(emulator_id))
        };

        self.ports.release_all(cleanup.ports.into_values());
        match was {
            EmulatorState::Starting => {
                tracing::error!(emulator = emulator_id, "emulator {described} before reporting online");
            }
            _ => {
                tracing::info!(emulator = emulator_id, "emulator {described}");
            }
        }
    }
}

fn validate_id(kind: &str, id: &str) -> BrokerResult<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(BrokerError::InvalidArgument(format!(
            "{kind} id {id:?} must be a non-empty string of letters, digits, '.', '_' or '-'"
        )))
    }
}

fn emulator_not_found(emulator_id: &str) -> BrokerError {
    BrokerError::NotFound(format!("emulator {emulator_id:?} does not exist"))
}

fn rule_not_found(rule_id: &str) -> BrokerError {
    BrokerError::NotFound(format!("rule {rule_id:?} does not exist"))
}

fn rule_spec(rule: &RuleRecord) -> RuleSpec {
    RuleSpec {
        rule_id: rule.rule_id.clone(),
        target_patterns: rule.target_patterns.clone(),
        resolved_host: rule.resolved_host.clone(),
        requires_secure_connection: rule.requires_secure_connection,
    }
}

fn emulator_view(inner: &Inner, record: &EmulatorRecord) -> EmulatorView {
    let rule = inner
        .rules
        .get(&record.rule_id)
        .map(rule_spec)
        .unwrap_or_else(|| RuleSpec {
            rule_id: record.rule_id.clone(),
            ..RuleSpec::default()
        });
    EmulatorView {
        emulator_id: record.emulator_id.clone(),
        state: record.state,
        start_on_demand: record.start_on_demand,
        rule,
        start_command: record.start_command.clone(),
        expanded_command: record.expanded_command.clone(),
        ports: record.leased_ports.clone(),
    }
}

fn spawn_output_prefixer<R>(emulator_id: String, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(emulator = %emulator_id, "{stream}: {line}");
        }
        tracing::debug!(emulator = %emulator_id, "{stream} closed");
    });
}

async fn terminate_child(emulator_id: &str, pid: u32, process: Option<Arc<ProcessHandle>>) {
    if let Err(error) = signal_process(pid, Signal::SIGINT) {
        tracing::warn!(%error, emulator = emulator_id, "failed to send SIGINT");
    }
    let Some(process) = process else {
        return;
    };
    if timeout(STOP_GRACE, process.wait_for_exit()).await.is_err() {
        tracing::warn!(
            emulator = emulator_id,
            "process did not exit after SIGINT; escalating to SIGKILL"
        );
        if let Err(error) = signal_process(pid, Signal::SIGKILL) {
            tracing::error!(%error, emulator = emulator_id, "failed to send SIGKILL");
        }
        let _ = timeout(STOP_GRACE, process.wait_for_exit()).await;
    }
}

fn signal_process(pid: u32, signal: Signal) -> BrokerResult<()> {
    match send_unix_signal(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(err) if err == Errno::ESRCH => Ok(()),
        Err(err) => Err(BrokerError::Aborted(format!(
            "failed to send {signal:?} to pid {pid}: {err}"
        ))),
    }
}

fn exit_message(status: &std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {code}")
    } else if let Some(signal) = exit_signal(status) {
        format!("terminated by signal {signal}")
    } else {
        "exited".to_string()
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }

    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_broker(
        ranges: Vec<PortRange>,
        default_start_deadline: Option<Duration>,
    ) -> Arc<Broker> {
        Arc::new(
            Broker::new(BrokerOptions {
                broker_address: "127.0.0.1:0".to_string(),
                port_ranges: ranges,
                default_start_deadline,
            })
            .expect("broker options are valid"),
        )
    }

    pub(crate) fn sleeper_spec(emulator_id: &str, start_on_demand: bool) -> EmulatorSpec {
        EmulatorSpec {
            emulator_id: emulator_id.to_string(),
            rule: RuleSpec {
                rule_id: format!("{emulator_id}_rule"),
                target_patterns: vec![format!("{emulator_id}_service")],
                ..RuleSpec::default()
            },
            start_command: CommandLine {
                path: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 30".to_string()],
            },
            start_on_demand,
        }
    }

    pub(crate) async fn wait_for_state(broker: &Broker, emulator_id: &str, state: EmulatorState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if broker
                .get_emulator(emulator_id)
                .map(|view| view.state == state)
                .unwrap_or(false)
            {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "emulator {emulator_id} never reached {state}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let broker = test_broker(Vec::new(), None);
        let spec = EmulatorSpec {
            emulator_id: "dummy".to_string(),
            rule: RuleSpec {
                rule_id: "dummy_rule".to_string(),
                target_patterns: vec!["pattern1".to_string(), "pattern2".to_string()],
                ..RuleSpec::default()
            },
            start_command: CommandLine {
                path: "/exepath".to_string(),
                args: vec!["arg1".to_string(), "arg2".to_string()],
            },
            start_on_demand: false,
        };
        broker.create_emulator(spec.clone()).expect("create");

        let view = broker.get_emulator("dummy").expect("get");
        assert_eq!(view.emulator_id, spec.emulator_id);
        assert_eq!(view.state, EmulatorState::Offline);
        assert_eq!(view.rule.rule_id, "dummy_rule");
        assert_eq!(view.rule.target_patterns, spec.rule.target_patterns);
        assert_eq!(view.start_command, spec.start_command);
        assert!(view.expanded_command.is_none());
    }

    #[test]
    fn create_rejects_invalid_input() {
        let broker = test_broker(Vec::new(), None);
        let mut bad_id = sleeper_spec("dummy", false);
        bad_id.emulator_id = "my/mistake".to_string();
        assert!(matches!(
            broker.create_emulator(bad_id).unwrap_err(),
            BrokerError::InvalidArgument(_)
        ));

        let mut bad_pattern = sleeper_spec("dummy", false);
        bad_pattern.rule.target_patterns = vec!["[".to_string()];
        assert!(matches!(
            broker.create_emulator(bad_pattern).unwrap_err(),
            BrokerError::InvalidArgument(_)
        ));

        let mut no_command = sleeper_spec("dummy", false);
        no_command.start_command.path = String::new();
        assert!(matches!(
            broker.create_emulator(no_command).unwrap_err(),
            BrokerError::InvalidArgument(_)
        ));
    }

    #[test]
    fn create_twice_is_already_exists() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("dummy", false))
            .expect("first create");
        assert!(matches!(
            broker
                .create_emulator(sleeper_spec("dummy", false))
                .unwrap_err(),
            BrokerError::AlreadyExists(_)
        ));
    }

    #[test]
    fn rule_create_is_idempotent_under_deep_equality() {
        let broker = test_broker(Vec::new(), None);
        let rule = RuleSpec {
            rule_id: "r".to_string(),
            target_patterns: vec!["a".to_string(), "b".to_string()],
            ..RuleSpec::default()
        };
        broker.create_resolve_rule(rule.clone()).expect("create");

        let mut reordered = rule.clone();
        reordered.target_patterns.reverse();
        broker
            .create_resolve_rule(reordered)
            .expect("identical rule is a no-op");

        let mut differing = rule;
        differing.resolved_host = "elsewhere".to_string();
        assert!(matches!(
            broker.create_resolve_rule(differing).unwrap_err(),
            BrokerError::AlreadyExists(_)
        ));
    }

    #[test]
    fn update_rule_merges_patterns_and_overwrites_scalars() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_resolve_rule(RuleSpec {
                rule_id: "r".to_string(),
                target_patterns: vec!["pattern1".to_string(), "pattern2".to_string()],
                ..RuleSpec::default()
            })
            .expect("create");

        let updated = broker
            .update_resolve_rule(RuleSpec {
                rule_id: "r".to_string(),
                target_patterns: vec!["newPattern".to_string()],
                resolved_host: "localhost:99".to_string(),
                requires_secure_connection: true,
            })
            .expect("update");

        assert_eq!(
            updated.target_patterns,
            vec!["pattern1", "pattern2", "newPattern"]
        );
        assert_eq!(updated.resolved_host, "localhost:99");
        assert!(updated.requires_secure_connection);
        assert_eq!(broker.get_resolve_rule("r").expect("get"), updated);

        assert!(matches!(
            broker
                .update_resolve_rule(RuleSpec {
                    rule_id: "absent".to_string(),
                    ..RuleSpec::default()
                })
                .unwrap_err(),
            BrokerError::NotFound(_)
        ));
    }

    #[test]
    fn report_online_requires_starting() {
        let broker = test_broker(Vec::new(), None);
        assert!(matches!(
            broker
                .report_emulator_online("ghost", "t".to_string(), Vec::new())
                .unwrap_err(),
            BrokerError::NotFound(_)
        ));

        broker
            .create_emulator(sleeper_spec("dummy", false))
            .expect("create");
        assert!(matches!(
            broker
                .report_emulator_online("dummy", "t".to_string(), Vec::new())
                .unwrap_err(),
            BrokerError::FailedPrecondition(_)
        ));
    }

    #[tokio::test]
    async fn start_reaches_online_when_child_reports() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("real", false))
            .expect("create");

        let starter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("real", None).await })
        };
        wait_for_state(&broker, "real", EmulatorState::Starting).await;

        broker
            .report_emulator_online(
                "real",
                "localhost:20000".to_string(),
                vec!["newPattern".to_string()],
            )
            .expect("report online");

        starter.await.expect("join").expect("start succeeds");
        let view = broker.get_emulator("real").expect("get");
        assert_eq!(view.state, EmulatorState::Online);
        assert_eq!(view.rule.resolved_host, "localhost:20000");
        assert!(view.expanded_command.is_some());
        assert!(
            view.rule
                .target_patterns
                .iter()
                .any(|pattern| pattern == "newPattern")
        );

        // A second start against an online emulator is rejected.
        assert!(matches!(
            broker.start_emulator("real", None).await.unwrap_err(),
            BrokerError::AlreadyExists(_)
        ));

        broker.stop_emulator("real").await.expect("stop");
        let view = broker.get_emulator("real").expect("get");
        assert_eq!(view.state, EmulatorState::Offline);
        assert_eq!(view.rule.resolved_host, "");
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_child_and_one_outcome() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("real", false))
            .expect("create");

        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("real", None).await })
        };
        wait_for_state(&broker, "real", EmulatorState::Starting).await;
        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("real", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        broker
            .report_emulator_online("real", "localhost:1".to_string(), Vec::new())
            .expect("report online");

        first.await.expect("join").expect("first start succeeds");
        second.await.expect("join").expect("second start succeeds");

        let inner = broker.inner.lock();
        assert_eq!(inner.emulators["real"].generation, 1);
        drop(inner);

        broker.stop_emulator("real").await.expect("stop");
    }

    #[tokio::test]
    async fn start_deadline_reverts_to_offline_and_releases_ports() {
        let broker = test_broker(
            vec![PortRange {
                begin: 41200,
                end: 41201,
            }],
            Some(Duration::from_millis(300)),
        );
        let mut spec = sleeper_spec("slow", false);
        // The trailing argument only exists to exercise port substitution.
        spec.start_command.args = vec![
            "-c".to_string(),
            "sleep 30".to_string(),
            "--port={port:main}".to_string(),
        ];
        broker.create_emulator(spec).expect("create");

        let err = broker.start_emulator("slow", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::DeadlineExceeded(_)));

        let view = broker.get_emulator("slow").expect("get");
        assert_eq!(view.state, EmulatorState::Offline);
        assert!(view.ports.is_empty());
        // The single configured port must be leasable again.
        assert_eq!(broker.ports.next().expect("port released"), 41200);
    }

    #[tokio::test]
    async fn caller_deadline_bounds_the_wait() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("slow", false))
            .expect("create");

        let caller_deadline = Instant::now() + Duration::from_millis(300);
        let err = broker
            .start_emulator("slow", Some(caller_deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn child_exit_before_online_aborts_the_start() {
        let broker = test_broker(Vec::new(), None);
        let mut spec = sleeper_spec("flaky", false);
        spec.start_command.args = vec!["-c".to_string(), "exit 3".to_string()];
        broker.create_emulator(spec).expect("create");

        let err = broker.start_emulator("flaky", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Aborted(_)));
        let view = broker.get_emulator("flaky").expect("get");
        assert_eq!(view.state, EmulatorState::Offline);
    }

    #[tokio::test]
    async fn child_exit_while_online_reverts_to_offline() {
        let broker = test_broker(Vec::new(), None);
        let mut spec = sleeper_spec("brief", false);
        spec.start_command.args = vec!["-c".to_string(), "sleep 1".to_string()];
        broker.create_emulator(spec).expect("create");

        let starter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("brief", None).await })
        };
        wait_for_state(&broker, "brief", EmulatorState::Starting).await;
        broker
            .report_emulator_online("brief", "localhost:2".to_string(), Vec::new())
            .expect("report online");
        starter.await.expect("join").expect("start succeeds");

        wait_for_state(&broker, "brief", EmulatorState::Offline).await;
        let view = broker.get_emulator("brief").expect("get");
        assert_eq!(view.rule.resolved_host, "");
    }

    #[tokio::test]
    async fn stop_offline_is_a_no_op_and_spawn_failure_aborts() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("dummy", false))
            .expect("create");
        broker.stop_emulator("dummy").await.expect("stop offline");

        let mut unrunnable = sleeper_spec("broken", false);
        unrunnable.start_command.path = "/nonexistent/emulator-binary".to_string();
        broker.create_emulator(unrunnable).expect("create");
        let err = broker.start_emulator("broken", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Aborted(_)));
        assert_eq!(
            broker.get_emulator("broken").expect("get").state,
            EmulatorState::Offline
        );
    }

    #[tokio::test]
    async fn delete_stops_running_emulator_and_keeps_rule() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("real", false))
            .expect("create");

        let starter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("real", None).await })
        };
        wait_for_state(&broker, "real", EmulatorState::Starting).await;
        broker
            .report_emulator_online("real", "localhost:3".to_string(), Vec::new())
            .expect("report online");
        starter.await.expect("join").expect("start succeeds");

        broker.delete_emulator("real").await.expect("delete");
        assert!(matches!(
            broker.get_emulator("real").unwrap_err(),
            BrokerError::NotFound(_)
        ));
        // The rule survives as a standalone rule, host cleared by the stop.
        let rule = broker.get_resolve_rule("real_rule").expect("rule remains");
        assert_eq!(rule.resolved_host, "");
    }
}
