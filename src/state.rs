//! In-memory records for emulators, resolve rules, and their wait primitives.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, time::Instant};

use crate::broker::error::{BrokerError, BrokerResult};

/// Path plus ordered arguments, possibly containing substitution tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmulatorState {
    Offline,
    Starting,
    Online,
}

impl EmulatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            EmulatorState::Offline => "OFFLINE",
            EmulatorState::Starting => "STARTING",
            EmulatorState::Online => "ONLINE",
        }
    }
}

impl std::fmt::Display for EmulatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one start cycle, delivered to every waiter.
pub type StartOutcome = BrokerResult<()>;

/// One-shot broadcast signaling that a start cycle has concluded.
///
/// Re-created on every OFFLINE -> STARTING transition. The first caller of
/// [`Readiness::fire`] decides the outcome; later calls are no-ops.
#[derive(Debug, Default)]
pub struct Readiness {
    notify: Notify,
    outcome: Mutex<Option<StartOutcome>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome if none has been recorded yet. Returns whether this
    /// caller was the first writer.
    pub fn fire(&self, outcome: StartOutcome) -> bool {
        {
            let mut guard = self.outcome.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(outcome);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn outcome(&self) -> Option<StartOutcome> {
        self.outcome.lock().clone()
    }

    pub async fn wait(&self) -> StartOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking, or a fire landing in between
            // would never wake this waiter.
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// Exit signal for a spawned child, completed by its wait task.
#[derive(Debug, Default)]
pub struct ProcessHandle {
    exit_notify: Notify,
    exited: AtomicBool,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_for_exit(&self) {
        loop {
            let notified = self.exit_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.exited.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn signal_exit(&self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.exit_notify.notify_waiters();
        }
    }
}

/// A named mapping from target patterns to a resolved host.
///
/// Rules are independently keyed; an emulator references its rule by id so
/// that record and rule never own one another.
#[derive(Debug)]
pub struct RuleRecord {
    pub rule_id: String,
    pub target_patterns: Vec<String>,
    compiled: Vec<Regex>,
    pub resolved_host: String,
    pub requires_secure_connection: bool,
}

impl RuleRecord {
    pub fn new(
        rule_id: String,
        patterns: Vec<String>,
        resolved_host: String,
        requires_secure_connection: bool,
    ) -> BrokerResult<Self> {
        let mut record = Self {
            rule_id,
            target_patterns: Vec::new(),
            compiled: Vec::new(),
            resolved_host,
            requires_secure_connection,
        };
        record.merge_patterns(&patterns)?;
        Ok(record)
    }

    /// Set-union new patterns into the rule, keeping insertion order and
    /// compiling each unseen pattern.
    pub fn merge_patterns(&mut self, patterns: &[String]) -> BrokerResult<()> {
        for pattern in patterns {
            if self.target_patterns.iter().any(|have| have == pattern) {
                continue;
            }
            let compiled = Regex::new(pattern).map_err(|error| {
                BrokerError::InvalidArgument(format!(
                    "target pattern {pattern:?} does not compile: {error}"
                ))
            })?;
            self.target_patterns.push(pattern.clone());
            self.compiled.push(compiled);
        }
        Ok(())
    }

    pub fn matches(&self, target: &str) -> bool {
        self.compiled.iter().any(|regex| regex.is_match(target))
    }

    /// Deep equality against a submitted definition, ignoring pattern order.
    pub fn same_definition(
        &self,
        patterns: &[String],
        resolved_host: &str,
        requires_secure_connection: bool,
    ) -> bool {
        if self.resolved_host != resolved_host
            || self.requires_secure_connection != requires_secure_connection
        {
            return false;
        }
        let mut mine: Vec<&str> = self.target_patterns.iter().map(String::as_str).collect();
        let mut theirs: Vec<&str> = patterns.iter().map(String::as_str).collect();
        mine.sort_unstable();
        mine.dedup();
        theirs.sort_unstable();
        theirs.dedup();
        mine == theirs
    }
}

/// Per-emulator state: metadata plus the lifecycle fields that are only
/// touched under the registry mutex.
#[derive(Debug)]
pub struct EmulatorRecord {
    pub emulator_id: String,
    pub rule_id: String,
    pub start_command: CommandLine,
    pub start_on_demand: bool,

    pub state: EmulatorState,
    /// Monotonically increasing start-cycle counter. Background observers
    /// capture it and act only while it is still current.
    pub generation: u64,
    pub pid: Option<u32>,
    pub expanded_command: Option<CommandLine>,
    pub leased_ports: HashMap<String, u16>,
    pub start_deadline: Option<Instant>,
    pub readiness: Option<Arc<Readiness>>,
    pub process: Option<Arc<ProcessHandle>>,
}

impl EmulatorRecord {
    pub fn new(
        emulator_id: String,
        rule_id: String,
        start_command: CommandLine,
        start_on_demand: bool,
    ) -> Self {
        Self {
            emulator_id,
            rule_id,
            start_command,
            start_on_demand,
            state: EmulatorState::Offline,
            generation: 0,
            pid: None,
            expanded_command: None,
            leased_ports: HashMap::new(),
            start_deadline: None,
            readiness: None,
            process: None,
        }
    }

    /// OFFLINE -> STARTING: arm a fresh readiness signal and open a new
    /// start cycle.
    pub fn begin_start(&mut self, deadline: Option<Instant>) -> Arc<Readiness> {
        self.generation += 1;
        self.state = EmulatorState::Starting;
        self.start_deadline = deadline;
        let readiness = Arc::new(Readiness::new());
        self.readiness = Some(readiness.clone());
        readiness
    }

    /// Revert to OFFLINE, returning the ports leased for the concluded cycle
    /// so the caller can release them.
    pub fn reset_offline(&mut self) -> HashMap<String, u16> {
        self.state = EmulatorState::Offline;
        self.pid = None;
        self.expanded_command = None;
        self.start_deadline = None;
        self.readiness = None;
        self.process = None;
        std::mem::take(&mut self.leased_ports)
    }
}
