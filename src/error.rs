//! Error types for rteval
//!
//! Errors are split by the boundary they cross:
//!
//! - [`WorkloadError`] is raised by a workload's lifecycle hooks and never leaves
//!   the unit's worker thread. The worker converts it into the unit's
//!   `runtime_error` flag and keeps the message for the group to report.
//! - [`RunError`] is what the group and orchestrator APIs return to the caller.
//! - [`ConfigError`] covers everything that can go wrong while resolving
//!   command-line options, config files and per-module options.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a single workload while it prepares or runs.
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// Required external resources are missing or unusable
    #[error("setup failed: {0}")]
    Setup(String),

    /// One-time build/prepare step failed
    #[error("build failed: {0}")]
    Build(String),

    /// A task iteration failed
    #[error("task failed: {0}")]
    Task(String),

    /// Invalid module option
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkloadError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

/// Run-level errors returned by workload groups and the orchestrator.
#[derive(Error, Debug)]
pub enum RunError {
    /// A group was asked to start or stop without any configured members
    #[error("no {group} modules configured")]
    NoMembers { group: String },

    /// A member failed while the group was waiting for it to become ready
    #[error("{group} module '{unit}' failed during startup: {reason}")]
    Startup {
        group: String,
        unit: String,
        reason: String,
    },

    /// Fewer load workers are running than were unleashed
    #[error("load thread died! ({observed} of {expected} load workers still running)")]
    LoadDied { expected: usize, observed: usize },

    /// The run was aborted by SIGTERM
    #[error("SIGTERM received, run aborted")]
    Terminated,

    /// SIGINT arrived while modules were still starting
    #[error("SIGINT received while waiting for modules to become ready")]
    Interrupted,

    /// A module name that is not present in the registry
    #[error("unknown {kind} module '{name}'")]
    UnknownModule { kind: String, name: String },

    /// The same module was added to a group twice
    #[error("{group} module '{name}' is already registered")]
    DuplicateModule { group: String, name: String },

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A module or run option has a value that cannot be parsed
    #[error("invalid value '{value}' for option '{section}.{key}'")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    /// A `-O module.key=value` argument without the expected shape
    #[error("malformed module option '{0}' (expected module.key=value)")]
    MalformedOption(String),

    /// The config file could not be read or parsed
    #[error("cannot load config file {path}: {reason}")]
    File { path: PathBuf, reason: String },

    /// A required system property could not be detected
    #[error("cannot detect {0}")]
    Detection(String),
}

/// Result type alias for run-level operations
pub type RunResult<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_messages_name_the_failing_unit() {
        let err = RunError::Startup {
            group: "load".to_string(),
            unit: "kcompile".to_string(),
            reason: "build failed: make returned 2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("kcompile"));
        assert!(msg.contains("make returned 2"));

        let err = RunError::LoadDied {
            expected: 2,
            observed: 1,
        };
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn test_config_error_converts_into_workload_error() {
        let cfg = ConfigError::InvalidValue {
            section: "cyclictest".to_string(),
            key: "priority".to_string(),
            value: "high".to_string(),
        };
        let err: WorkloadError = cfg.into();
        assert_eq!(
            err.to_string(),
            "invalid value 'high' for option 'cyclictest.priority'"
        );
    }
}
