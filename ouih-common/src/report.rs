//! Machine-readable scenario results.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, HarnessError};
use crate::types::Transport;

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub label: String,
    pub passed: bool,
    pub elapsed_ms: u64,
    /// Trials used by action steps, rounds used by retry groups.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    /// Index of the failing step; `None` for setup and deadline failures.
    pub step: Option<usize>,
    pub step_label: Option<String>,
    pub message: String,
    /// Last output lines of the role involved.
    pub tail: Vec<String>,
    pub elapsed_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl FailureReport {
    pub fn from_error(err: &HarnessError, step: Option<(usize, &str)>) -> Self {
        let (elapsed, timeout) = match err.timing() {
            Some((elapsed, timeout)) => (Some(elapsed), timeout),
            None => match err {
                HarnessError::ScenarioTimeout { deadline, .. } => (None, Some(*deadline)),
                _ => (None, None),
            },
        };
        Self {
            kind: err.kind(),
            step: step.map(|(index, _)| index),
            step_label: step.map(|(_, label)| label.to_string()),
            message: err.to_string(),
            tail: err.tail().to_vec(),
            elapsed_ms: elapsed.map(millis),
            timeout_ms: timeout.map(millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(FailureReport),
}

/// Result of running one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub transport: Transport,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub steps: Vec<StepRecord>,
    /// Captures observed during the run, as `role.name` -> value.
    pub captures: BTreeMap<String, String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Passed)
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match &self.outcome {
            Outcome::Passed => None,
            Outcome::Failed(failure) => Some(failure),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let status = if self.passed() { "PASSED" } else { "FAILED" };
        let _ = writeln!(
            out,
            "{} [{}] {} in {:.1}s",
            self.scenario,
            self.transport,
            status,
            self.duration_ms as f64 / 1000.0
        );
        for step in &self.steps {
            let mark = if step.passed { "ok" } else { "FAIL" };
            let _ = write!(out, "  {:>2}. {:<4} {}", step.index, mark, step.label);
            if step.attempts > 1 {
                let _ = write!(out, " ({} attempts)", step.attempts);
            }
            let _ = writeln!(out);
        }
        if let Some(failure) = self.failure() {
            let _ = writeln!(out, "  {}: {}", failure.kind, failure.message);
            if let (Some(elapsed), Some(timeout)) = (failure.elapsed_ms, failure.timeout_ms) {
                let _ = writeln!(out, "  waited {elapsed}ms of {timeout}ms");
            }
            if !failure.tail.is_empty() {
                let _ = writeln!(out, "  last output:");
                for line in &failure.tail {
                    let _ = writeln!(out, "    | {line}");
                }
            }
        }
        out
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessState;

    #[test]
    fn failure_carries_timing_and_tail() {
        let err = HarnessError::PatternMatchTimeout {
            role: "tcp_client".into(),
            target: "state listening".into(),
            timeout: Duration::from_secs(15),
            elapsed: Duration::from_millis(15_002),
            last_state: ProcessState::Starting,
            tail: vec!["booting".into()],
        };
        let failure = FailureReport::from_error(&err, Some((2, "await tcp_client listening")));
        assert_eq!(failure.kind, FailureKind::PatternMatchTimeout);
        assert_eq!(failure.step, Some(2));
        assert_eq!(failure.timeout_ms, Some(15_000));
        assert_eq!(failure.elapsed_ms, Some(15_002));
        assert_eq!(failure.tail, ["booting"]);
    }

    #[test]
    fn json_marks_outcome() {
        let report = ScenarioReport {
            scenario: "test_tcp_transport".into(),
            transport: Transport::Tcp,
            started_at: Utc::now(),
            duration_ms: 1200,
            outcome: Outcome::Passed,
            steps: vec![StepRecord {
                index: 0,
                label: "launch tcp_injector".into(),
                passed: true,
                elapsed_ms: 3,
                attempts: 1,
                detail: None,
            }],
            captures: BTreeMap::from([("tcp_injector.port".into(), "7070".into())]),
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"]["status"], "passed");
        assert_eq!(json["transport"], "tcp");
        assert_eq!(json["captures"]["tcp_injector.port"], "7070");
        assert!(report.summary().contains("PASSED"));
    }
}
