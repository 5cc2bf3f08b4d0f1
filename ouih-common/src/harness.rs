//! Top-level coordinator.
//!
//! The [`Harness`] owns the validated configuration, the timeout policy, the
//! scenario registry and the run directory. Every scenario gets its own
//! [`ScenarioSession`] which is torn down whatever the outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{ConfigError, HarnessError, HarnessResult};
use crate::report::{FailureReport, Outcome, ScenarioReport, millis};
use crate::scenario::{Scenario, ScenarioRunner, StepFailure};
use crate::scenarios;
use crate::session::ScenarioSession;
use crate::timeout::TimeoutPolicy;

/// Run directories older than this are removed when a harness starts.
pub const STALE_RUN_AGE: Duration = Duration::from_secs(3600);

const RUN_DIR_PREFIX: &str = "run_";

/// Remove run directories under `base_dir` not modified within `max_age`.
/// Returns how many were removed.
pub fn cleanup_stale_runs(base_dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return 0;
    };

    let now = SystemTime::now();
    let mut cleaned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let ours = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(RUN_DIR_PREFIX));
        if !ours || !path.is_dir() {
            continue;
        }

        let is_stale = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if is_stale && std::fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }

    if cleaned > 0 {
        info!(base_dir = %base_dir.display(), cleaned, "removed stale run directories");
    }
    cleaned
}

pub struct Harness {
    config: Arc<HarnessConfig>,
    policy: TimeoutPolicy,
    registry: BTreeMap<String, Scenario>,
    run_dir: PathBuf,
    all_passed: bool,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("run_dir", &self.run_dir)
            .field("scenarios", &self.registry.keys().collect::<Vec<_>>())
            .field("all_passed", &self.all_passed)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Validate `config` and create a fresh run directory.
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;

        let root = &config.defaults.run_dir_root;
        cleanup_stale_runs(root, STALE_RUN_AGE);

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let run_dir = root.join(format!(
            "{RUN_DIR_PREFIX}{timestamp}_{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&run_dir)?;
        info!(run_dir = %run_dir.display(), "harness initialized");

        Ok(Self {
            policy: config.timeout_policy(),
            config: Arc::new(config),
            registry: BTreeMap::new(),
            run_dir,
            all_passed: true,
        })
    }

    /// Register the built-in transport and cache scenarios.
    pub fn with_builtin_scenarios(mut self) -> HarnessResult<Self> {
        for scenario in scenarios::builtin(&self.config) {
            self.register(scenario)?;
        }
        Ok(self)
    }

    pub fn register(&mut self, scenario: Scenario) -> HarnessResult<()> {
        if self.registry.contains_key(&scenario.name) {
            return Err(ConfigError::InvalidValue {
                field: format!("scenarios.{}", scenario.name),
                message: "scenario names must be unique".to_string(),
            }
            .into());
        }
        debug!(scenario = %scenario.name, "scenario registered");
        self.registry.insert(scenario.name.clone(), scenario);
        Ok(())
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &Scenario> {
        self.registry.values()
    }

    pub fn scenario(&self, name: &str) -> HarnessResult<&Scenario> {
        self.registry
            .get(name)
            .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// True while no scenario run by this harness has failed.
    pub fn all_passed(&self) -> bool {
        self.all_passed
    }

    /// Run a registered scenario by name.
    pub async fn run_scenario(&mut self, name: &str) -> HarnessResult<ScenarioReport> {
        let scenario = self.scenario(name)?.clone();
        Ok(self.run(&scenario).await)
    }

    /// Run the named scenarios, or every registered one when `names` is
    /// empty. Unknown names are rejected before anything starts.
    pub async fn run_all(&mut self, names: &[String]) -> HarnessResult<Vec<ScenarioReport>> {
        let selected: Vec<Scenario> = if names.is_empty() {
            self.registry.values().cloned().collect()
        } else {
            names
                .iter()
                .map(|name| self.scenario(name).cloned())
                .collect::<HarnessResult<_>>()?
        };

        let mut reports = Vec::with_capacity(selected.len());
        for scenario in &selected {
            reports.push(self.run(scenario).await);
        }
        Ok(reports)
    }

    /// Run `scenario` to completion. Teardown always happens: graceful on
    /// success, immediate kill on failure.
    pub async fn run(&mut self, scenario: &Scenario) -> ScenarioReport {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(scenario = %scenario.name, transport = %scenario.transport, "running scenario");

        let dir = self.run_dir.join(&scenario.name);
        let mut session = match ScenarioSession::new(&scenario.name, Arc::clone(&self.config), dir)
        {
            Ok(session) => session,
            Err(error) => {
                self.all_passed = false;
                error!(scenario = %scenario.name, "scenario setup failed: {error}");
                return ScenarioReport {
                    scenario: scenario.name.clone(),
                    transport: scenario.transport,
                    started_at,
                    duration_ms: millis(started.elapsed()),
                    outcome: Outcome::Failed(FailureReport::from_error(&error, None)),
                    steps: Vec::new(),
                    captures: BTreeMap::new(),
                };
            }
        };

        let (steps, result) = {
            let mut runner = ScenarioRunner::new(&mut session, &self.policy, scenario);
            let result = match scenario.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, runner.run()).await {
                    Ok(result) => result,
                    Err(_) => {
                        let index = runner.records().len();
                        Err(StepFailure {
                            step: scenario
                                .steps
                                .get(index)
                                .map(|step| (index, step.label())),
                            error: HarnessError::ScenarioTimeout {
                                scenario: scenario.name.clone(),
                                deadline,
                            },
                        })
                    }
                },
                None => runner.run().await,
            };
            (runner.into_records(), result)
        };

        let mut captures = session.tracker().all_captures();
        captures.extend(
            session
                .vars()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        session.teardown(result.is_ok()).await;

        let outcome = match result {
            Ok(()) => {
                info!(scenario = %scenario.name, elapsed = ?started.elapsed(), "scenario passed");
                Outcome::Passed
            }
            Err(failure) => {
                self.all_passed = false;
                error!(
                    scenario = %scenario.name,
                    kind = %failure.error.kind(),
                    "scenario failed: {failure}"
                );
                for line in failure.error.tail() {
                    warn!(scenario = %scenario.name, "| {line}");
                }
                let step = failure
                    .step
                    .as_ref()
                    .map(|(index, label)| (*index, label.as_str()));
                Outcome::Failed(FailureReport::from_error(&failure.error, step))
            }
        };

        ScenarioReport {
            scenario: scenario.name.clone(),
            transport: scenario.transport,
            started_at,
            duration_ms: millis(started.elapsed()),
            outcome,
            steps,
            captures,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.all_passed && !self.config.defaults.keep_run_dir {
            match std::fs::remove_dir_all(&self.run_dir) {
                Ok(()) => debug!(run_dir = %self.run_dir.display(), "run directory removed"),
                Err(e) => warn!(
                    run_dir = %self.run_dir.display(),
                    "failed to remove run directory: {e}"
                ),
            }
        } else {
            info!(run_dir = %self.run_dir.display(), "run directory kept");
        }
    }
}
