//! Scenarios and the runner that executes them.
//!
//! A [`Scenario`] is an ordered list of [`Step`]s referring to roles by
//! name. The [`ScenarioRunner`] executes them strictly in order against a
//! [`ScenarioSession`]; the first failing step aborts the rest. Action steps
//! run an explicit bounded retry loop with a fixed delay between trials.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::probe::{Expect, HttpProbe, Mismatch, Probe, ProbeResponse, check_all};
use crate::report::{StepRecord, millis};
use crate::session::ScenarioSession;
use crate::timeout::TimeoutPolicy;
use crate::types::{StateKind, Transport};

/// Bounded retry budget of an action step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_trials: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_trials: u32, delay: Duration) -> Self {
        Self {
            max_trials: max_trials.max(1),
            delay,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// External call performed by an action step.
#[derive(Debug, Clone)]
pub enum Action {
    /// HTTP GET of a templated URL, through `via`'s proxy port when set.
    Http { via: Option<String>, url: String },
    /// Any custom probe.
    Probe(Arc<dyn Probe>),
    /// Passes once `trigger` fired for `role`; the body is the matched line.
    TriggerFired { role: String, trigger: String },
}

#[derive(Debug, Clone)]
pub struct ActionStep {
    pub label: String,
    pub action: Action,
    pub expect: Vec<Expect>,
    /// Defaults to the transport budget of the role involved.
    pub retry: Option<RetryPolicy>,
}

impl ActionStep {
    pub fn new(label: impl Into<String>, action: Action) -> Self {
        Self {
            label: label.into(),
            action,
            expect: Vec::new(),
            retry: None,
        }
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect.push(expect);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    fn role(&self) -> Option<&str> {
        match &self.action {
            Action::Http { via, .. } => via.as_deref(),
            Action::TriggerFired { role, .. } => Some(role),
            Action::Probe(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Launch {
        role: String,
    },
    Stop {
        role: String,
    },
    /// Wait for a readiness state. `timeout` defaults to the policy's.
    AwaitState {
        role: String,
        state: StateKind,
        timeout: Option<Duration>,
    },
    AwaitTrigger {
        role: String,
        trigger: String,
        timeout: Option<Duration>,
    },
    Sleep(Duration),
    StartOrigin,
    /// Store a fresh lowercase token of `response_length` letters in `var`.
    Nonce {
        var: String,
    },
    /// Store the trimmed content of `<role_dir>/<file>` in `var`; an empty
    /// file fails the step.
    ReadFile {
        role: String,
        file: String,
        var: String,
    },
    /// Log the time from `trigger` firing on `role` until now; fails when
    /// the trigger never fired.
    ReportElapsed {
        label: String,
        role: String,
        trigger: String,
    },
    Action(ActionStep),
    /// Re-run `steps` up to `rounds` times, stopping `stop_between` after a
    /// failed round. Only assertion and network failures are retried.
    Retry {
        label: String,
        rounds: u32,
        steps: Vec<Step>,
        stop_between: Vec<String>,
    },
}

impl Step {
    pub fn launch(role: &str) -> Self {
        Self::Launch {
            role: role.to_string(),
        }
    }

    pub fn stop(role: &str) -> Self {
        Self::Stop {
            role: role.to_string(),
        }
    }

    pub fn await_state(role: &str, state: StateKind) -> Self {
        Self::AwaitState {
            role: role.to_string(),
            state,
            timeout: None,
        }
    }

    pub fn await_state_within(role: &str, state: StateKind, timeout: Duration) -> Self {
        Self::AwaitState {
            role: role.to_string(),
            state,
            timeout: Some(timeout),
        }
    }

    pub fn await_trigger(role: &str, trigger: &str) -> Self {
        Self::AwaitTrigger {
            role: role.to_string(),
            trigger: trigger.to_string(),
            timeout: None,
        }
    }

    pub fn nonce(var: &str) -> Self {
        Self::Nonce {
            var: var.to_string(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Launch { role } => format!("launch {role}"),
            Self::Stop { role } => format!("stop {role}"),
            Self::AwaitState { role, state, .. } => format!("await {role} {state}"),
            Self::AwaitTrigger { role, trigger, .. } => format!("await {role} {trigger}"),
            Self::Sleep(duration) => format!("sleep {}", humantime::format_duration(*duration)),
            Self::StartOrigin => "start origin".to_string(),
            Self::Nonce { var } => format!("nonce {var}"),
            Self::ReadFile { role, file, .. } => format!("read {role}/{file}"),
            Self::ReportElapsed { label, .. } => label.clone(),
            Self::Action(action) => action.label.clone(),
            Self::Retry { label, .. } => label.clone(),
        }
    }
}

impl From<ActionStep> for Step {
    fn from(action: ActionStep) -> Self {
        Self::Action(action)
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub transport: Transport,
    pub steps: Vec<Step>,
    /// Cap on the whole run, teardown excluded.
    pub deadline: Option<Duration>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            transport,
            steps: Vec::new(),
            deadline: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Every role the scenario launches, nested rounds included.
    pub fn roles(&self) -> BTreeSet<&str> {
        fn collect<'s>(steps: &'s [Step], out: &mut BTreeSet<&'s str>) {
            for step in steps {
                match step {
                    Step::Launch { role } => {
                        out.insert(role.as_str());
                    }
                    Step::Retry { steps, .. } => collect(steps, out),
                    _ => {}
                }
            }
        }
        let mut roles = BTreeSet::new();
        collect(&self.steps, &mut roles);
        roles
    }
}

/// The step a scenario failed at and why.
#[derive(Debug)]
pub struct StepFailure {
    /// `None` when the failure is not tied to a step (deadline).
    pub step: Option<(usize, String)>,
    pub error: HarnessError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some((index, label)) => write!(f, "step {index} ({label}): {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Executes a scenario's steps in order, recording each one.
pub struct ScenarioRunner<'a> {
    session: &'a mut ScenarioSession,
    policy: &'a TimeoutPolicy,
    scenario: &'a Scenario,
    records: Vec<StepRecord>,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        session: &'a mut ScenarioSession,
        policy: &'a TimeoutPolicy,
        scenario: &'a Scenario,
    ) -> Self {
        Self {
            session,
            policy,
            scenario,
            records: Vec::new(),
        }
    }

    /// Records of the steps executed so far, including a failed one.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }

    pub async fn run(&mut self) -> Result<(), StepFailure> {
        let scenario = self.scenario;
        info!(scenario = %scenario.name, steps = scenario.steps.len(), "scenario started");
        for (index, step) in scenario.steps.iter().enumerate() {
            let label = step.label();
            let started = Instant::now();
            debug!(scenario = %scenario.name, index, step = %label, "running step");

            let result = self.execute(step).await;
            let passed = result.is_ok();
            self.records.push(StepRecord {
                index,
                label: label.clone(),
                passed,
                elapsed_ms: millis(started.elapsed()),
                attempts: *result.as_ref().unwrap_or(&1),
                detail: result.as_ref().err().map(ToString::to_string),
            });

            if let Err(error) = result {
                warn!(scenario = %scenario.name, index, step = %label, "step failed: {error}");
                return Err(StepFailure {
                    step: Some((index, label)),
                    error,
                });
            }
        }
        info!(scenario = %scenario.name, "scenario steps completed");
        Ok(())
    }

    /// Run one step; returns the number of attempts it took.
    fn execute<'s>(
        &'s mut self,
        step: &'s Step,
    ) -> Pin<Box<dyn Future<Output = HarnessResult<u32>> + 's>> {
        Box::pin(async move {
            match step {
                Step::Launch { role } => self.session.launch(role).await.map(|()| 1),
                Step::Stop { role } => self.session.stop(role).await.map(|()| 1),
                Step::AwaitState {
                    role,
                    state,
                    timeout,
                } => {
                    let timeout = self.await_timeout(role, *timeout)?;
                    let captures = self.session.await_state(role, *state, timeout).await?;
                    if !captures.is_empty() {
                        info!(role = %role, ?captures, "{state} reached");
                    }
                    Ok(1)
                }
                Step::AwaitTrigger {
                    role,
                    trigger,
                    timeout,
                } => {
                    let timeout = self.await_timeout(role, *timeout)?;
                    self.session.await_trigger(role, trigger, timeout).await?;
                    Ok(1)
                }
                Step::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(1)
                }
                Step::StartOrigin => self.session.start_origin().await.map(|()| 1),
                Step::Nonce { var } => {
                    let token = nonce(self.session.config().defaults.response_length);
                    self.session.set_var(var.as_str(), token);
                    Ok(1)
                }
                Step::ReadFile { role, file, var } => {
                    let content = self.session.read_role_file(role, file).await?;
                    if content.is_empty() {
                        return Err(HarnessError::AssertionFailed {
                            step: format!("read {role}/{file}"),
                            expected: "non-empty file".to_string(),
                            actual: "empty file".to_string(),
                            attempts: 1,
                        });
                    }
                    self.session.set_var(var.as_str(), content);
                    Ok(1)
                }
                Step::ReportElapsed {
                    label,
                    role,
                    trigger,
                } => {
                    let event = self.session.milestone(role, trigger)?.ok_or_else(|| {
                        HarnessError::AssertionFailed {
                            step: label.clone(),
                            expected: format!("trigger {trigger} fired"),
                            actual: "not fired".to_string(),
                            attempts: 1,
                        }
                    })?;
                    let elapsed = chrono::Utc::now() - event.timestamp;
                    info!(
                        role = %role,
                        trigger = %trigger,
                        elapsed_ms = elapsed.num_milliseconds(),
                        "{label}"
                    );
                    Ok(1)
                }
                Step::Action(action) => self.run_action(action).await,
                Step::Retry {
                    label,
                    rounds,
                    steps,
                    stop_between,
                } => self.run_rounds(label, *rounds, steps, stop_between).await,
            }
        })
    }

    fn await_timeout(&self, role: &str, explicit: Option<Duration>) -> HarnessResult<Duration> {
        if let Some(timeout) = explicit {
            return Ok(timeout);
        }
        let transport = self.session.role_spec(role)?.transport;
        Ok(self.policy.resolve(&self.scenario.name, transport))
    }

    fn retry_policy(&self, action: &ActionStep) -> RetryPolicy {
        if let Some(policy) = action.retry {
            return policy;
        }
        match action.role().and_then(|role| self.session.role_spec(role).ok()) {
            Some(spec) => {
                let settings = self.session.config().transport(spec.transport);
                RetryPolicy::new(settings.max_trials, settings.trial_delay)
            }
            None => RetryPolicy::once(),
        }
    }

    async fn run_action(&mut self, step: &ActionStep) -> HarnessResult<u32> {
        let policy = self.retry_policy(step);
        let expects = step
            .expect
            .iter()
            .map(|expect| match expect {
                Expect::Body(template) => self.session.render(template).map(Expect::Body),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let probe = self.build_probe(&step.action)?;

        let mut last = Mismatch {
            expected: String::new(),
            actual: String::new(),
        };
        for attempt in 1..=policy.max_trials {
            let outcome = match (&step.action, &probe) {
                (Action::TriggerFired { role, trigger }, _) => {
                    self.trigger_trial(role, trigger, &expects)?
                }
                (_, Some(probe)) => run_probe(Arc::clone(probe), &expects).await,
                (_, None) => missing_probe(),
            };
            match outcome {
                Ok(()) => {
                    info!(step = %step.label, attempt, "action succeeded");
                    return Ok(attempt);
                }
                Err(mismatch) => {
                    debug!(
                        step = %step.label,
                        attempt,
                        max_trials = policy.max_trials,
                        expected = %mismatch.expected,
                        actual = %mismatch.actual,
                        "trial failed"
                    );
                    last = mismatch;
                }
            }
            if attempt < policy.max_trials && !policy.delay.is_zero() {
                tokio::time::sleep(policy.delay).await;
            }
        }

        Err(HarnessError::AssertionFailed {
            step: step.label.clone(),
            expected: last.expected,
            actual: last.actual,
            attempts: policy.max_trials,
        })
    }

    fn build_probe(&self, action: &Action) -> HarnessResult<Option<Arc<dyn Probe>>> {
        Ok(match action {
            Action::Http { via, url } => {
                let url = self.session.render(url)?;
                let mut probe = HttpProbe::new(url, self.session.config().defaults.http_timeout);
                if let Some(role) = via {
                    probe = probe.via_proxy(self.session.role_port(role)?);
                }
                Some(Arc::new(probe))
            }
            Action::Probe(probe) => Some(Arc::clone(probe)),
            Action::TriggerFired { .. } => None,
        })
    }

    fn trigger_trial(
        &self,
        role: &str,
        trigger: &str,
        expects: &[Expect],
    ) -> HarnessResult<Result<(), Mismatch>> {
        Ok(match self.session.milestone(role, trigger)? {
            Some(event) => check_all(
                expects,
                &ProbeResponse {
                    status: 200,
                    body: event.line,
                },
            ),
            None => Err(Mismatch {
                expected: format!("trigger {trigger} fired on {role}"),
                actual: "not fired".to_string(),
            }),
        })
    }

    async fn run_rounds(
        &mut self,
        label: &str,
        rounds: u32,
        steps: &[Step],
        stop_between: &[String],
    ) -> HarnessResult<u32> {
        let rounds = rounds.max(1);
        let mut round = 1;
        loop {
            info!(step = label, round, rounds, "retry round started");
            let mut result = Ok(());
            for step in steps {
                if let Err(e) = self.execute(step).await {
                    result = Err(e);
                    break;
                }
            }
            let error = match result {
                Ok(()) => return Ok(round),
                Err(e) => e,
            };
            let retryable = matches!(
                error,
                HarnessError::AssertionFailed { .. } | HarnessError::Http { .. }
            );
            if !retryable || round == rounds {
                return Err(error);
            }
            warn!(step = label, round, "round failed, retrying: {error}");
            for role in stop_between {
                if self.session.is_running(role) {
                    self.session.stop(role).await?;
                }
            }
            round += 1;
        }
    }
}

async fn run_probe(probe: Arc<dyn Probe>, expects: &[Expect]) -> Result<(), Mismatch> {
    let description = probe.describe();
    let response = tokio::task::spawn_blocking(move || probe.probe())
        .await
        .map_err(|e| HarnessError::Http {
            url: description,
            message: format!("probe task failed: {e}"),
        })
        .and_then(|result| result);
    match response {
        Ok(response) => check_all(expects, &response),
        Err(e) => Err(Mismatch {
            expected: expects
                .first()
                .map(describe_expect)
                .unwrap_or_else(|| "successful probe".to_string()),
            actual: e.to_string(),
        }),
    }
}

fn missing_probe() -> Result<(), Mismatch> {
    Err(Mismatch {
        expected: "probe".to_string(),
        actual: "no probe configured".to_string(),
    })
}

fn describe_expect(expect: &Expect) -> String {
    match expect {
        Expect::Status(status) => format!("status {status}"),
        Expect::Body(body) => format!("body {body:?}"),
        Expect::BodyMatches(regex) => format!("body matching /{}/", regex.as_str()),
        Expect::BodyLength(len) => format!("body of {len} bytes"),
    }
}

/// Random lowercase ASCII token of `length` letters.
pub fn nonce(length: usize) -> String {
    (0..length)
        .map(|_| char::from(rand::random_range(b'a'..=b'z')))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_lowercase_and_sized() {
        let token = nonce(20);
        assert_eq!(token.len(), 20);
        assert!(token.chars().all(|c| c.is_ascii_lowercase()));
        assert_ne!(nonce(20), nonce(20));
        assert_eq!(nonce(45).len(), 45);
    }

    #[test]
    fn nonce_positions_cover_the_alphabet() {
        let mut seen = vec![std::collections::BTreeSet::new(); 20];
        for _ in 0..2000 {
            for (position, letter) in nonce(20).chars().enumerate() {
                seen[position].insert(letter);
            }
        }
        for (position, letters) in seen.iter().enumerate() {
            assert_eq!(letters.len(), 26, "position {position} only drew {letters:?}");
        }
    }

    #[test]
    fn retry_policy_never_zero() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_trials, 1);
    }

    #[test]
    fn labels_describe_steps() {
        assert_eq!(Step::launch("tcp_injector").label(), "launch tcp_injector");
        assert_eq!(
            Step::await_state("tcp_client", StateKind::Listening).label(),
            "await tcp_client listening"
        );
        assert_eq!(Step::Sleep(Duration::from_secs(60)).label(), "sleep 1m");
    }
}
