//! Layered readiness deadlines.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::HarnessConfig;
use crate::types::Transport;

/// Which layer of the table a resolved timeout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutSource {
    Scenario,
    Transport,
    Default,
}

impl std::fmt::Display for TimeoutSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Scenario => "scenario",
            Self::Transport => "transport",
            Self::Default => "default",
        })
    }
}

/// Scenario name / transport -> duration, with a global fallback.
///
/// Immutable once built, so resolving the same pair twice always yields
/// the same value.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    scenario: HashMap<String, Duration>,
    transport: HashMap<Transport, Duration>,
    default: Duration,
}

impl TimeoutPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            scenario: HashMap::new(),
            transport: HashMap::new(),
            default,
        }
    }

    pub fn with_scenario(mut self, name: impl Into<String>, timeout: Duration) -> Self {
        self.scenario.insert(name.into(), timeout);
        self
    }

    pub fn with_transport(mut self, transport: Transport, timeout: Duration) -> Self {
        self.transport.insert(transport, timeout);
        self
    }

    /// Only transports present in `config.transports` get a layer of their
    /// own; the rest resolve to `defaults.timeout`.
    pub fn from_config(config: &HarnessConfig) -> Self {
        let policy = Transport::ALL
            .into_iter()
            .filter_map(|transport| {
                config
                    .transports
                    .get(transport.as_str())
                    .map(|settings| (transport, settings.timeout))
            })
            .fold(Self::new(config.defaults.timeout), |policy, (transport, timeout)| {
                policy.with_transport(transport, timeout)
            });
        config
            .scenario_timeouts
            .iter()
            .fold(policy, |policy, (name, timeout)| {
                policy.with_scenario(name, *timeout)
            })
    }

    /// Exact scenario entry, then transport default, then global default.
    pub fn resolve(&self, scenario: &str, transport: Transport) -> Duration {
        self.resolve_with_source(scenario, transport).0
    }

    pub fn resolve_with_source(
        &self,
        scenario: &str,
        transport: Transport,
    ) -> (Duration, TimeoutSource) {
        if let Some(timeout) = self.scenario.get(scenario) {
            (*timeout, TimeoutSource::Scenario)
        } else if let Some(timeout) = self.transport.get(&transport) {
            (*timeout, TimeoutSource::Transport)
        } else {
            (self.default, TimeoutSource::Default)
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }
}
