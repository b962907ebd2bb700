//! Data structures for tracking process state.
//!
//! This module defines the validated specification of an application
//! (`AppSpec`), its lifecycle status (`ProcessStatus`), the lock-protected
//! status/pid pair (`RunState`) and the registry entry that ties them together
//! (`ManagedProcess`). Operator actions valid for each status are derived by
//! [`actions_for`].

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::AppConfig;
use crate::errors::ConfigError;
use crate::output::OutputSink;

/// Validated, immutable configuration of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    /// Display name, also used as the log label.
    pub name: String,
    /// Working directory for the start and stop commands.
    pub cwd: Option<PathBuf>,
    /// Passthrough display field.
    pub port: Option<u16>,
    /// Passthrough display field.
    pub url: Option<String>,
    start_command: Vec<String>,
    stop_command: Option<Vec<String>>,
    env: Vec<(String, String)>,
}

impl AppSpec {
    /// Creates a spec with the given start command.
    pub fn new(name: impl Into<String>, start_command: Vec<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if start_command.first().map_or(true, |cmd| cmd.is_empty()) {
            return Err(ConfigError::EmptyStartCommand { name });
        }
        Ok(Self {
            name,
            cwd: None,
            port: None,
            url: None,
            start_command,
            stop_command: None,
            env: Vec::new(),
        })
    }

    /// Validates one `[[app]]` entry.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        let name = config.name.clone();
        let start_command = match &config.start_command {
            Some(command) => command.to_argv().map_err(|err| ConfigError::BadCommand {
                name: name.clone(),
                field: "start_command",
                reason: err.to_string(),
            })?,
            None => Vec::new(),
        };
        let stop_command = config
            .stop_command
            .as_ref()
            .map(|command| {
                command.to_argv().map_err(|err| ConfigError::BadCommand {
                    name: name.clone(),
                    field: "stop_command",
                    reason: err.to_string(),
                })
            })
            .transpose()?
            .filter(|argv| !argv.is_empty());
        let env = config
            .env
            .iter()
            .map(|entry| split_env(&name, entry))
            .collect::<Result<Vec<_>, _>>()?;

        let mut spec = AppSpec::new(name, start_command)?;
        spec.cwd = config.path.as_ref().map(PathBuf::from);
        spec.port = config.port;
        spec.url = config.url.clone();
        spec.stop_command = stop_command;
        spec.env = env;
        Ok(spec)
    }

    #[cfg(test)]
    pub fn with_stop_command(mut self, stop_command: Vec<String>) -> Self {
        self.stop_command = Some(stop_command).filter(|argv| !argv.is_empty());
        self
    }

    #[cfg(test)]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[cfg(test)]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Never empty.
    pub fn start_command(&self) -> &[String] {
        &self.start_command
    }

    pub fn stop_command(&self) -> Option<&[String]> {
        self.stop_command.as_deref()
    }

    /// Overrides layered over the inherited environment, in config order.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

fn split_env(name: &str, entry: &str) -> Result<(String, String), ConfigError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::BadEnv {
            name: name.to_string(),
            entry: entry.to_string(),
        }),
    }
}

/// The current lifecycle status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// A start was requested and the spawn has not completed.
    Starting,
    /// Spawned and, as far as the last poll knows, alive.
    Running,
    /// Not running (initial state, or stopped by the operator).
    Stopped,
    /// Failed to spawn, or died without being stopped.
    Error,
}

impl ProcessStatus {
    /// Whether a pid is expected for this status.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            ProcessStatus::Starting => "Starting",
            ProcessStatus::Running => "Running",
            ProcessStatus::Stopped => "Stopped",
            ProcessStatus::Error => "Error",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Status and pid of one entry. Always read and written together.
///
/// The pid is `Some` only while the status is `Starting` (after spawn) or
/// `Running`; every transition out of those states clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    status: ProcessStatus,
    pid: Option<u32>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            pid: None,
        }
    }
}

impl RunState {
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Moves to `Starting` unless a process is already active.
    pub(crate) fn begin_start(&mut self) -> Result<(), ProcessStatus> {
        if self.status.is_active() {
            return Err(self.status);
        }
        self.status = ProcessStatus::Starting;
        self.pid = None;
        Ok(())
    }

    pub(crate) fn mark_running(&mut self, pid: u32) {
        self.status = ProcessStatus::Running;
        self.pid = Some(pid);
    }

    pub(crate) fn mark_spawn_failed(&mut self) {
        self.status = ProcessStatus::Error;
        self.pid = None;
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.status = ProcessStatus::Stopped;
        self.pid = None;
    }

    /// Running with `pid` -> Error. Anything else is left alone.
    pub(crate) fn mark_lost(&mut self, pid: u32) -> bool {
        if self.status != ProcessStatus::Running || self.pid != Some(pid) {
            return false;
        }
        self.status = ProcessStatus::Error;
        self.pid = None;
        true
    }
}

/// One registry entry: immutable spec, output sink and guarded run state.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: AppSpec,
    sink: OutputSink,
    state: Mutex<RunState>,
}

impl ManagedProcess {
    /// A fresh entry is always `Stopped` with no pid.
    pub fn new(spec: AppSpec, sink: OutputSink) -> Self {
        Self {
            spec,
            sink,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn spec(&self) -> &AppSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    pub fn state(&self) -> RunState {
        *self.lock()
    }

    pub fn status(&self) -> ProcessStatus {
        self.lock().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Consistent snapshot of the display fields.
    pub fn view(&self) -> ProcessView {
        let state = self.state();
        ProcessView {
            name: self.spec.name.clone(),
            status: state.status,
            pid: state.pid,
            port: self.spec.port,
            url: self.spec.url.clone(),
        }
    }

    /// Runs `f` with the state lock held. Never hold it across an await.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only copy of what the table shows for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessView {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
}

impl ProcessView {
    pub fn header() -> String {
        format!(
            "{:<30} | {:<10} | {:<6} | {:<6} | {:<30}",
            "Name", "Status", "PID", "Port", "URL"
        )
    }

    pub fn row_text(&self) -> String {
        format!(
            "{:<30} | {:<10} | {:<6} | {:<6} | {:<30}",
            self.name,
            self.status,
            self.pid.unwrap_or(0),
            self.port.unwrap_or(0),
            self.url.as_deref().unwrap_or("")
        )
    }

    pub fn actions(&self) -> &'static [Action] {
        actions_for(self.status)
    }

    pub fn prompt(&self) -> String {
        match self.status {
            ProcessStatus::Running => format!("Do you want to shut down {}?", self.name),
            ProcessStatus::Starting => format!("{} is starting", self.name),
            ProcessStatus::Stopped | ProcessStatus::Error => {
                format!("Do you want to launch {}?", self.name)
            }
        }
    }
}

/// Operator actions offered for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Launch,
    Shutdown,
    Cancel,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::Launch => "Launch",
            Action::Shutdown => "Shutdown",
            Action::Cancel => "Cancel",
        }
    }
}

/// Actions that make sense for an entry in `status`.
pub fn actions_for(status: ProcessStatus) -> &'static [Action] {
    match status {
        ProcessStatus::Running => &[Action::Shutdown, Action::Cancel],
        ProcessStatus::Stopped | ProcessStatus::Error => &[Action::Launch, Action::Cancel],
        ProcessStatus::Starting => &[Action::Cancel],
    }
}
