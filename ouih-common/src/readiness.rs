//! Per-role readiness state machine.
//!
//! The tracker is fed by two sources only: watcher match events and process
//! exit notifications. Each role's status lives in a `watch` channel so that
//! any number of awaits can block on it while output keeps being consumed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::process::{ExitInfo, OutputTail};
use crate::types::{ProcessState, RoleKind, StateKind};
use crate::watcher::{Captures, MatchEvent, TriggerEffect};

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub to: StateKind,
    /// Event that caused the change; `None` for launch and exit.
    pub event: Option<MatchEvent>,
    pub at: DateTime<Utc>,
}

/// Snapshot of a role's readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role: String,
    pub kind: RoleKind,
    pub state: ProcessState,
    pub transitions: Vec<Transition>,
    /// Latest event of every trigger that fired, keyed by trigger name.
    pub milestones: BTreeMap<String, MatchEvent>,
    /// Degraded -> Ready recoveries so far.
    pub recoveries: u32,
}

impl RoleStatus {
    fn new(role: &str, kind: RoleKind) -> Self {
        Self {
            role: role.to_string(),
            kind,
            state: ProcessState::NotStarted,
            transitions: Vec::new(),
            milestones: BTreeMap::new(),
            recoveries: 0,
        }
    }

    fn transition(&mut self, state: ProcessState, event: Option<MatchEvent>) {
        info!(role = %self.role, from = %self.state, to = %state, "state transition");
        self.transitions.push(Transition {
            to: state.kind(),
            event,
            at: Utc::now(),
        });
        self.state = state;
    }

    /// Captures of the transition that first reached `target`, if any.
    fn reached(&self, target: StateKind) -> Option<Captures> {
        self.transitions
            .iter()
            .find(|t| {
                if target == StateKind::Degraded {
                    t.to == StateKind::Degraded
                } else if target.is_terminal() {
                    t.to == target
                } else {
                    !t.to.is_terminal() && t.to.rank() >= target.rank()
                }
            })
            .map(|t| {
                t.event
                    .as_ref()
                    .map(|event| event.captures.clone())
                    .unwrap_or_default()
            })
    }

    fn fatal_event(&self) -> Option<&MatchEvent> {
        self.transitions
            .iter()
            .rev()
            .filter_map(|t| t.event.as_ref())
            .find(|event| event.effect == TriggerEffect::Fatal)
    }
}

struct Entry {
    status: watch::Sender<RoleStatus>,
    tail: OutputTail,
}

/// Readiness of every role of a scenario.
pub struct ReadinessTracker {
    roles: Mutex<HashMap<String, Entry>>,
    max_recoveries: u32,
    tail_lines: usize,
}

impl std::fmt::Debug for ReadinessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessTracker")
            .field("max_recoveries", &self.max_recoveries)
            .field("tail_lines", &self.tail_lines)
            .finish_non_exhaustive()
    }
}

impl ReadinessTracker {
    pub fn new(max_recoveries: u32, tail_lines: usize) -> Self {
        Self {
            roles: Mutex::new(HashMap::new()),
            max_recoveries,
            tail_lines,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `role` from `NotStarted`, resetting any earlier status.
    /// Returns the output tail the role's watcher should record into.
    pub fn register(&self, role: &str, kind: RoleKind) -> OutputTail {
        let tail = OutputTail::new(self.tail_lines);
        let mut roles = self.lock();
        match roles.get_mut(role) {
            Some(entry) => {
                entry.status.send_replace(RoleStatus::new(role, kind));
                entry.tail = tail.clone();
            }
            None => {
                let (status, _) = watch::channel(RoleStatus::new(role, kind));
                roles.insert(
                    role.to_string(),
                    Entry {
                        status,
                        tail: tail.clone(),
                    },
                );
            }
        }
        tail
    }

    fn with_entry<T>(&self, role: &str, f: impl FnOnce(&Entry) -> T) -> HarnessResult<T> {
        let roles = self.lock();
        roles
            .get(role)
            .map(f)
            .ok_or_else(|| HarnessError::UnknownRole(role.to_string()))
    }

    /// The process was spawned.
    pub fn mark_started(&self, role: &str) -> HarnessResult<()> {
        self.with_entry(role, |entry| {
            entry.status.send_if_modified(|status| {
                if status.state == ProcessState::NotStarted {
                    status.transition(ProcessState::Starting, None);
                    true
                } else {
                    false
                }
            });
        })
    }

    /// Apply a watcher event. Returns whether the state changed.
    pub fn apply(&self, role: &str, event: &MatchEvent) -> HarnessResult<bool> {
        let max_recoveries = self.max_recoveries;
        self.with_entry(role, |entry| {
            let mut changed = false;
            entry.status.send_modify(|status| {
                status
                    .milestones
                    .insert(event.trigger.clone(), event.clone());
                changed = advance(status, event, max_recoveries);
            });
            changed
        })
    }

    /// The process exited. A role already `Failed` keeps that state.
    pub fn mark_exited(&self, role: &str, exit: ExitInfo) -> HarnessResult<()> {
        self.with_entry(role, |entry| {
            entry.status.send_modify(|status| {
                if matches!(status.state, ProcessState::Failed(_)) {
                    debug!(role, %exit, "failed role exited");
                } else {
                    status.transition(ProcessState::Exited(exit.code), None);
                }
            });
        })
    }

    pub fn status(&self, role: &str) -> HarnessResult<RoleStatus> {
        self.with_entry(role, |entry| entry.status.borrow().clone())
    }

    pub fn state(&self, role: &str) -> HarnessResult<ProcessState> {
        self.with_entry(role, |entry| entry.status.borrow().state.clone())
    }

    /// Most recent output lines of `role`.
    pub fn tail(&self, role: &str) -> Vec<String> {
        self.with_entry(role, |entry| entry.tail.lines())
            .unwrap_or_default()
    }

    /// Value of capture `key` from any trigger that fired for `role`.
    pub fn capture(&self, role: &str, key: &str) -> Option<String> {
        self.with_entry(role, |entry| {
            let status = entry.status.borrow();
            status
                .milestones
                .values()
                .rev()
                .find_map(|event| event.captures.get(key).cloned())
        })
        .ok()
        .flatten()
    }

    /// All captures of every role, as `role.key` pairs.
    pub fn all_captures(&self) -> BTreeMap<String, String> {
        let roles = self.lock();
        let mut out = BTreeMap::new();
        for (role, entry) in roles.iter() {
            for event in entry.status.borrow().milestones.values() {
                for (key, value) in &event.captures {
                    out.insert(format!("{role}.{key}"), value.clone());
                }
            }
        }
        out
    }

    fn subscribe(&self, role: &str) -> HarnessResult<watch::Receiver<RoleStatus>> {
        self.with_entry(role, |entry| entry.status.subscribe())
    }

    /// Wait until `role` reaches `target` (or already went past it) and
    /// return the captures of the event that brought it there.
    ///
    /// Fails immediately when the role fails or exits first, and with
    /// `PatternMatchTimeout` once `timeout` elapses.
    pub async fn await_state(
        &self,
        role: &str,
        target: StateKind,
        timeout: Duration,
    ) -> HarnessResult<Captures> {
        debug!(role, %target, ?timeout, "awaiting state");
        self.await_condition(role, &format!("state {target}"), timeout, |status| {
            status.reached(target)
        })
        .await
    }

    /// Wait until trigger `trigger` fired for `role`.
    pub async fn await_trigger(
        &self,
        role: &str,
        trigger: &str,
        timeout: Duration,
    ) -> HarnessResult<Captures> {
        debug!(role, trigger, ?timeout, "awaiting trigger");
        self.await_condition(role, &format!("trigger {trigger}"), timeout, |status| {
            status
                .milestones
                .get(trigger)
                .map(|event| event.captures.clone())
        })
        .await
    }

    async fn await_condition<F>(
        &self,
        role: &str,
        target: &str,
        timeout: Duration,
        reached: F,
    ) -> HarnessResult<Captures>
    where
        F: Fn(&RoleStatus) -> Option<Captures>,
    {
        let started = Instant::now();
        // `None` when the timeout is too large to represent: wait unbounded.
        let deadline = started.checked_add(timeout);
        let mut rx = self.subscribe(role)?;

        loop {
            // The borrow must end before `early_failure` takes the roles lock.
            let finished = {
                let status = rx.borrow_and_update();
                if let Some(captures) = reached(&status) {
                    debug!(role, target, elapsed = ?started.elapsed(), "condition reached");
                    return Ok(captures);
                }
                status.state.is_terminal().then(|| status.clone())
            };
            if let Some(status) = finished {
                return Err(self.early_failure(&status, target, started.elapsed()));
            }

            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.changed()).await,
                None => Ok(rx.changed().await),
            };
            match changed {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(HarnessError::RoleNotRunning(role.to_string())),
                Err(_) => {
                    let last_state = rx.borrow().state.clone();
                    warn!(role, target, ?timeout, %last_state, "readiness wait timed out");
                    return Err(HarnessError::PatternMatchTimeout {
                        role: role.to_string(),
                        target: target.to_string(),
                        timeout,
                        elapsed: started.elapsed(),
                        last_state,
                        tail: self.tail(role),
                    });
                }
            }
        }
    }

    fn early_failure(&self, status: &RoleStatus, target: &str, elapsed: Duration) -> HarnessError {
        let tail = self.tail(&status.role);
        match (&status.state, status.fatal_event()) {
            (ProcessState::Failed(_), Some(event)) => HarnessError::FatalMarkerDetected {
                role: status.role.clone(),
                line: event.line.clone(),
                elapsed,
                tail,
            },
            _ => HarnessError::ProcessExited {
                role: status.role.clone(),
                target: target.to_string(),
                state: status.state.clone(),
                elapsed,
                tail,
            },
        }
    }
}

/// Move `status` forward according to `event`.
fn advance(status: &mut RoleStatus, event: &MatchEvent, max_recoveries: u32) -> bool {
    if status.state.is_terminal() {
        return false;
    }

    match event.effect {
        TriggerEffect::Fatal => {
            let reason = event
                .captures
                .get("reason")
                .filter(|reason| !reason.is_empty())
                .cloned()
                .unwrap_or_else(|| event.line.clone());
            warn!(role = %status.role, trigger = %event.trigger, %reason, "fatal marker detected");
            status.transition(ProcessState::Failed(reason), Some(event.clone()));
            true
        }
        TriggerEffect::Degrade => {
            if status.state == ProcessState::Ready {
                status.transition(ProcessState::Degraded, Some(event.clone()));
                true
            } else {
                false
            }
        }
        TriggerEffect::Milestone => {
            debug!(role = %status.role, trigger = %event.trigger, "milestone reached");
            false
        }
        effect => {
            let Some(target) = effect.advance_target() else {
                return false;
            };
            if status.state == ProcessState::Degraded && target == StateKind::Ready {
                status.recoveries += 1;
                if status.recoveries > max_recoveries {
                    status.transition(
                        ProcessState::Failed(format!(
                            "recovery budget of {max_recoveries} exhausted"
                        )),
                        Some(event.clone()),
                    );
                } else {
                    status.transition(ProcessState::Ready, Some(event.clone()));
                }
                return true;
            }
            if target.rank() <= status.state.kind().rank() {
                return false;
            }
            match ProcessState::from_live_kind(target) {
                Some(state) => {
                    status.transition(state, Some(event.clone()));
                    true
                }
                None => false,
            }
        }
    }
}
