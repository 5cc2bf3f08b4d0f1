//! `OUIH_*` environment overrides.
//!
//! Errors are collected rather than returned one at a time so every bad
//! variable is reported together.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::HarnessConfig;
use crate::error::ConfigError;
use crate::types::RoleKind;

/// An `OUIH_*` variable whose value could not be used.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Not a boolean or integer where one is expected.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Not parseable by `humantime`.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Environment overrides recognised by the harness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvOverrides {
    pub default_timeout: Option<Duration>,
    pub grace_period: Option<Duration>,
    pub window_lines: Option<usize>,
    pub keep_run_dir: Option<bool>,
    pub run_dir_root: Option<PathBuf>,
    pub injector_bin: Option<PathBuf>,
    pub client_bin: Option<PathBuf>,
}

struct EnvParser<F> {
    prefix: &'static str,
    lookup: F,
    errors: Vec<EnvError>,
}

impl<F> EnvParser<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = format!("{}{}", self.prefix, name);
        (self.lookup)(&var)
            .filter(|value| !value.trim().is_empty())
            .map(|value| (var, value))
    }

    fn duration(&mut self, name: &str) -> Option<Duration> {
        let (var, value) = self.raw(name)?;
        match humantime::parse_duration(value.trim()) {
            Ok(duration) => Some(duration),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                None
            }
        }
    }

    fn bool(&mut self, name: &str) -> Option<bool> {
        let (var, value) = self.raw(name)?;
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    fn usize_range(&mut self, name: &str, min: usize, max: usize) -> Option<usize> {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<usize>() {
            Ok(n) if (min..=max).contains(&n) => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    fn path(&mut self, name: &str) -> Option<PathBuf> {
        self.raw(name).map(|(_, value)| PathBuf::from(value.trim()))
    }
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut parser = EnvParser {
            prefix: "OUIH_",
            lookup,
            errors: Vec::new(),
        };

        let overrides = Self {
            default_timeout: parser.duration("DEFAULT_TIMEOUT"),
            grace_period: parser.duration("GRACE_PERIOD"),
            window_lines: parser.usize_range("WINDOW_LINES", 1, 4096),
            keep_run_dir: parser.bool("KEEP_RUN_DIR"),
            run_dir_root: parser.path("RUN_DIR_ROOT"),
            injector_bin: parser.path("INJECTOR_BIN"),
            client_bin: parser.path("CLIENT_BIN"),
        };

        if parser.errors.is_empty() {
            Ok(overrides)
        } else {
            Err(ConfigError::Env(parser.errors))
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the overrides on top of `config`.
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(timeout) = self.default_timeout {
            config.defaults.timeout = timeout;
        }
        if let Some(grace) = self.grace_period {
            config.defaults.grace_period = grace;
        }
        if let Some(lines) = self.window_lines {
            config.defaults.window_lines = lines;
        }
        if let Some(keep) = self.keep_run_dir {
            config.defaults.keep_run_dir = keep;
        }
        if let Some(root) = &self.run_dir_root {
            config.defaults.run_dir_root = root.clone();
        }
        for (name, role) in &mut config.roles {
            let program = match role.kind {
                RoleKind::Injector => self.injector_bin.as_ref(),
                _ => self.client_bin.as_ref(),
            };
            if let Some(program) = program {
                debug!(role = %name, program = %program.display(), "program overridden from environment");
                role.program = program.clone();
            }
        }
    }
}
