//! Error taxonomy for harness operations.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::env::EnvError;
use crate::types::ProcessState;

/// A configuration that cannot be loaded or does not make sense.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid pattern for trigger '{trigger}': {source}")]
    InvalidPattern {
        trigger: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unresolved placeholder {{{placeholder}}} in '{template}'")]
    UnresolvedPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("Invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything that can fail a scenario or its setup.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Process for role {role} failed to start ({program}): {source}")]
    Spawn {
        role: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Timed out after {timeout:?} waiting for {role} to reach {target} (last state: {last_state})"
    )]
    PatternMatchTimeout {
        role: String,
        target: String,
        timeout: Duration,
        elapsed: Duration,
        last_state: ProcessState,
        tail: Vec<String>,
    },

    #[error("Process {role} exited ({state}) before reaching {target} after {elapsed:?}")]
    ProcessExited {
        role: String,
        target: String,
        state: ProcessState,
        elapsed: Duration,
        tail: Vec<String>,
    },

    #[error("Assertion failed in {step}: expected {expected}, got {actual} after {attempts} attempt(s)")]
    AssertionFailed {
        step: String,
        expected: String,
        actual: String,
        attempts: u32,
    },

    #[error("Fatal marker detected in {role} output: {line}")]
    FatalMarkerDetected {
        role: String,
        line: String,
        elapsed: Duration,
        tail: Vec<String>,
    },

    #[error("Scenario {scenario} exceeded its deadline of {deadline:?}")]
    ScenarioTimeout { scenario: String, deadline: Duration },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Role is not running: {0}")]
    RoleNotRunning(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Port {port} of role {role} is already taken by {holder}")]
    PortConflict {
        role: String,
        holder: String,
        port: u16,
    },

    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `Result` alias used throughout the engine.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Failure category reported in scenario reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SpawnError,
    PatternMatchTimeout,
    ProcessExited,
    AssertionFailure,
    FatalMarkerDetected,
    ScenarioTimeout,
    Configuration,
    Network,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::SpawnError => "spawn_error",
            Self::PatternMatchTimeout => "pattern_match_timeout",
            Self::ProcessExited => "process_exited",
            Self::AssertionFailure => "assertion_failure",
            Self::FatalMarkerDetected => "fatal_marker_detected",
            Self::ScenarioTimeout => "scenario_timeout",
            Self::Configuration => "configuration",
            Self::Network => "network",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

impl HarnessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Spawn { .. } => FailureKind::SpawnError,
            Self::PatternMatchTimeout { .. } => FailureKind::PatternMatchTimeout,
            Self::ProcessExited { .. } => FailureKind::ProcessExited,
            Self::AssertionFailed { .. } => FailureKind::AssertionFailure,
            Self::FatalMarkerDetected { .. } => FailureKind::FatalMarkerDetected,
            Self::ScenarioTimeout { .. } => FailureKind::ScenarioTimeout,
            Self::UnknownRole(_)
            | Self::UnknownScenario(_)
            | Self::PortConflict { .. }
            | Self::Config(_) => FailureKind::Configuration,
            Self::Http { .. } => FailureKind::Network,
            Self::RoleNotRunning(_) | Self::Io(_) => FailureKind::Internal,
        }
    }

    /// Buffered output tail captured when the error was raised, if any.
    pub fn tail(&self) -> &[String] {
        match self {
            Self::PatternMatchTimeout { tail, .. }
            | Self::ProcessExited { tail, .. }
            | Self::FatalMarkerDetected { tail, .. } => tail,
            _ => &[],
        }
    }

    /// Elapsed wait and configured timeout for readiness failures.
    pub fn timing(&self) -> Option<(Duration, Option<Duration>)> {
        match self {
            Self::PatternMatchTimeout {
                elapsed, timeout, ..
            } => Some((*elapsed, Some(*timeout))),
            Self::ProcessExited { elapsed, .. } | Self::FatalMarkerDetected { elapsed, .. } => {
                Some((*elapsed, None))
            }
            _ => None,
        }
    }
}
