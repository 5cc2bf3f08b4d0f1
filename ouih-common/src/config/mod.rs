//! Configuration for a harness run.
//!
//! A [`HarnessConfig`] is built once per run (defaults, then an optional TOML
//! file, then `OUIH_*` environment overrides), validated, and shared
//! read-only with every component through an `Arc`.

pub mod defaults;
pub mod duration;
pub mod env;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, HarnessError, HarnessResult};
use crate::timeout::TimeoutPolicy;
use crate::types::{RoleKind, Transport};
use crate::watcher::{Trigger, TriggerEffect};

pub use env::{EnvError, EnvOverrides};

/// Run-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    /// Global fallback for readiness waits.
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// How long `terminate` waits after SIGTERM before SIGKILL.
    #[serde(with = "duration")]
    pub grace_period: Duration,
    /// Per-request budget for HTTP action probes.
    #[serde(with = "duration")]
    pub http_timeout: Duration,
    /// Lines kept in the matching window of each watcher.
    pub window_lines: usize,
    /// Lines of output kept per role for failure diagnostics.
    pub tail_lines: usize,
    /// Degraded -> Ready recoveries allowed before a role is failed.
    pub max_recoveries: u32,
    /// Length of generated nonce tokens.
    pub response_length: usize,
    /// Parent directory of per-run directories.
    pub run_dir_root: PathBuf,
    /// Keep the run directory even when every scenario passed.
    pub keep_run_dir: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: defaults::DEFAULT_PROCESS_TIMEOUT,
            grace_period: defaults::DEFAULT_GRACE_PERIOD,
            http_timeout: defaults::DEFAULT_HTTP_TIMEOUT,
            window_lines: defaults::DEFAULT_WINDOW_LINES,
            tail_lines: defaults::DEFAULT_TAIL_LINES,
            max_recoveries: defaults::DEFAULT_MAX_RECOVERIES,
            response_length: defaults::RESPONSE_LENGTH,
            run_dir_root: defaults::default_run_dir_root(),
            keep_run_dir: false,
        }
    }
}

/// Timeout and retry budget of one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    #[serde(with = "duration")]
    pub timeout: Duration,
    #[serde(default = "one")]
    pub max_trials: u32,
    #[serde(default, with = "duration")]
    pub trial_delay: Duration,
}

fn one() -> u32 {
    1
}

/// How to launch one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleSpec {
    pub kind: RoleKind,
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub program: PathBuf,
    /// Arguments; `{placeholders}` are expanded at launch time.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Name of the config file generated in the role directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,
    /// Written verbatim into `config_file`.
    #[serde(default)]
    pub config_content: String,
}

/// Declarative form of a [`Trigger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerSpec {
    pub name: String,
    pub pattern: String,
    pub effect: TriggerEffect,
    /// Role kinds the trigger applies to; empty means all.
    #[serde(default)]
    pub roles: Vec<RoleKind>,
    /// Transports the trigger applies to; empty means all.
    #[serde(default)]
    pub transports: Vec<Transport>,
    #[serde(default)]
    pub repeatable: bool,
}

impl TriggerSpec {
    pub fn applies_to(&self, kind: RoleKind, transport: Transport) -> bool {
        (self.roles.is_empty() || self.roles.contains(&kind))
            && (self.transports.is_empty() || self.transports.contains(&transport))
    }

    pub fn compile(&self) -> Result<Trigger, ConfigError> {
        let trigger = Trigger::new(&self.name, &self.pattern, self.effect)
            .map_err(|source| ConfigError::InvalidPattern {
                trigger: self.name.clone(),
                source,
            })?
            .for_roles(self.roles.iter().copied());
        Ok(if self.repeatable {
            trigger.repeatable()
        } else {
            trigger
        })
    }
}

/// Test origin HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OriginSettings {
    pub port: u16,
    pub page_body: String,
    /// Host advertised in request URLs; a non-loopback local address is
    /// detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            port: defaults::TEST_HTTP_SERVER_PORT,
            page_body: defaults::TEST_PAGE_BODY.to_string(),
            advertise_host: None,
        }
    }
}

/// Immutable configuration of one harness run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub defaults: Defaults,
    /// Scenario name -> readiness timeout override.
    #[serde(with = "duration::map")]
    pub scenario_timeouts: BTreeMap<String, Duration>,
    /// Transport name (`tcp`, `i2p`, `ipfs_cache`) -> budgets.
    pub transports: BTreeMap<String, TransportSettings>,
    /// Role name -> launch description.
    pub roles: BTreeMap<String, RoleSpec>,
    pub triggers: Vec<TriggerSpec>,
    pub origin: OriginSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            scenario_timeouts: defaults::default_scenario_timeouts(),
            transports: defaults::default_transports(),
            roles: defaults::default_roles(),
            triggers: defaults::default_triggers(),
            origin: OriginSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded harness config");
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            field: "config".to_string(),
            message: e.to_string(),
        })
    }

    /// Check everything that can be checked before any process starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.defaults;
        if d.window_lines == 0 {
            return Err(invalid("defaults.window_lines", "must be at least 1"));
        }
        if d.response_length == 0 {
            return Err(invalid("defaults.response_length", "must be at least 1"));
        }
        if d.timeout.is_zero() {
            return Err(invalid("defaults.timeout", "must be non-zero"));
        }

        for (name, settings) in &self.transports {
            name.parse::<Transport>()
                .map_err(|message| invalid(&format!("transports.{name}"), &message))?;
            if settings.max_trials == 0 {
                return Err(invalid(
                    &format!("transports.{name}.max_trials"),
                    "must be at least 1",
                ));
            }
        }

        for (name, role) in &self.roles {
            let well_formed = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !well_formed {
                return Err(invalid(
                    &format!("roles.{name}"),
                    "role names may only contain letters, digits, '_' and '-'",
                ));
            }
            if role.program.as_os_str().is_empty() {
                return Err(invalid(&format!("roles.{name}.program"), "must not be empty"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.triggers {
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(
                    &format!("triggers.{}", spec.name),
                    "trigger names must be unique",
                ));
            }
            spec.compile()?;
        }
        Ok(())
    }

    pub fn role(&self, name: &str) -> HarnessResult<&RoleSpec> {
        self.roles
            .get(name)
            .ok_or_else(|| HarnessError::UnknownRole(name.to_string()))
    }

    /// Settings of `transport`; an unconfigured transport gets the global
    /// timeout and a single trial.
    pub fn transport(&self, transport: Transport) -> TransportSettings {
        self.transports
            .get(transport.as_str())
            .cloned()
            .unwrap_or(TransportSettings {
                timeout: self.defaults.timeout,
                max_trials: 1,
                trial_delay: Duration::ZERO,
            })
    }

    /// Compile the triggers that watch a role, fatal ones included.
    pub fn triggers_for(
        &self,
        kind: RoleKind,
        transport: Transport,
    ) -> Result<Vec<Trigger>, ConfigError> {
        self.triggers
            .iter()
            .filter(|spec| spec.applies_to(kind, transport))
            .map(TriggerSpec::compile)
            .collect()
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_config(self)
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
