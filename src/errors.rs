//! Error types for configuration and process supervision.

use thiserror::Error;

/// A problem with one `[[app]]` entry. Fatal to that entry only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: start_command is empty")]
    EmptyStartCommand { name: String },

    #[error("{name}: cannot parse {field}: {reason}")]
    BadCommand {
        name: String,
        field: &'static str,
        reason: String,
    },

    #[error("{name}: env entry {entry:?} is not KEY=VALUE")]
    BadEnv { name: String, entry: String },

    #[error("application without a name")]
    MissingName,
}

/// Failure of a Start or Stop request. The entry keeps a consistent state.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no application at index {0}")]
    UnknownProcess(usize),

    #[error("{name} is already {status}")]
    AlreadyActive { name: String, status: String },

    #[error("{name} is not running")]
    NotRunning { name: String },

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run stop command for {name}: {source}")]
    StopCommand {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal {name} (pid {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
