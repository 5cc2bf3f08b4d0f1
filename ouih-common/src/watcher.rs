//! Trigger matching over a process's output.
//!
//! Every arriving line is appended to a bounded window of recent lines, and
//! each armed trigger is tested against the part of the window it has not
//! consumed yet. Patterns may therefore span several lines (the fixture's
//! `[\s\S]*` style), but never more than `window_lines` of them. Matching on
//! free-form logs is heuristic: a marker split across more lines than the
//! window holds is missed, and a pattern loose enough to match unrelated
//! output fires early.
//!
//! Fatal triggers are evaluated before any positive trigger on every line.
//! Once one fires the watcher is terminated and emits nothing further.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::process::{LineStream, OutputTail};
use crate::types::{RoleKind, StateKind};

/// Named values captured by a trigger.
pub type Captures = BTreeMap<String, String>;

/// What a trigger means for the role's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEffect {
    Starting,
    Listening,
    Ready,
    /// Recorded, no state change.
    Milestone,
    /// Ready -> Degraded.
    Degrade,
    /// Forces Failed and stops the watcher.
    Fatal,
}

impl TriggerEffect {
    /// State a positive trigger advances to.
    pub fn advance_target(&self) -> Option<StateKind> {
        match self {
            Self::Starting => Some(StateKind::Starting),
            Self::Listening => Some(StateKind::Listening),
            Self::Ready => Some(StateKind::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Ready => "ready",
            Self::Milestone => "milestone",
            Self::Degrade => "degrade",
            Self::Fatal => "fatal",
        };
        write!(f, "{label}")
    }
}

/// A named pattern denoting a lifecycle milestone.
#[derive(Debug, Clone)]
pub struct Trigger {
    name: String,
    regex: Regex,
    effect: TriggerEffect,
    roles: Vec<RoleKind>,
    repeatable: bool,
}

impl Trigger {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        effect: TriggerEffect,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            regex: Regex::new(pattern)?,
            effect,
            roles: Vec::new(),
            repeatable: false,
        })
    }

    /// Restrict the trigger to some role kinds.
    pub fn for_roles(mut self, roles: impl IntoIterator<Item = RoleKind>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Allow the trigger to fire again on output that arrives after its
    /// previous firing.
    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn effect(&self) -> TriggerEffect {
        self.effect
    }

    pub fn applies_to(&self, kind: RoleKind) -> bool {
        self.roles.is_empty() || self.roles.contains(&kind)
    }

    pub fn is_fatal(&self) -> bool {
        self.effect == TriggerEffect::Fatal
    }

    fn captures_in(&self, text: &str) -> Option<Captures> {
        let caps = self.regex.captures(text)?;
        Some(
            self.regex
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), m.as_str().trim().to_string()))
                })
                .collect(),
        )
    }
}

/// A trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub trigger: String,
    pub effect: TriggerEffect,
    pub captures: Captures,
    pub timestamp: DateTime<Utc>,
    /// 1-based number of the line that completed the match.
    pub line_no: u64,
    pub line: String,
}

#[derive(Debug)]
struct Armed {
    trigger: Trigger,
    fired: bool,
    /// Lines numbered at or below this are invisible to the trigger.
    consumed_upto: u64,
}

impl Armed {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            fired: false,
            consumed_upto: 0,
        }
    }
}

/// Incremental multi-trigger matcher for one process.
#[derive(Debug)]
pub struct PatternWatcher {
    fatal: Vec<Armed>,
    positive: Vec<Armed>,
    window: VecDeque<(u64, String)>,
    window_lines: usize,
    lines_seen: u64,
    terminated: bool,
}

impl PatternWatcher {
    /// Fatal triggers are split out and always evaluated first; the others
    /// keep their registration order.
    pub fn new(triggers: impl IntoIterator<Item = Trigger>, window_lines: usize) -> Self {
        let (fatal, positive): (Vec<_>, Vec<_>) = triggers
            .into_iter()
            .map(Armed::new)
            .partition(|armed| armed.trigger.is_fatal());
        Self {
            fatal,
            positive,
            window: VecDeque::with_capacity(window_lines.max(1)),
            window_lines: window_lines.max(1),
            lines_seen: 0,
            terminated: false,
        }
    }

    /// True once a fatal trigger fired.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Names of triggers that have not fired yet.
    pub fn pending(&self) -> Vec<&str> {
        self.fatal
            .iter()
            .chain(&self.positive)
            .filter(|armed| !armed.fired)
            .map(|armed| armed.trigger.name())
            .collect()
    }

    /// Re-arm a fired trigger. It only sees output arriving after the reset.
    pub fn reset(&mut self, name: &str) -> bool {
        let lines_seen = self.lines_seen;
        match self
            .positive
            .iter_mut()
            .chain(self.fatal.iter_mut())
            .find(|armed| armed.trigger.name() == name)
        {
            Some(armed) => {
                armed.fired = false;
                armed.consumed_upto = lines_seen;
                true
            }
            None => false,
        }
    }

    /// Feed one line of output and return the triggers it completed.
    pub fn feed(&mut self, line: &str) -> Vec<MatchEvent> {
        if self.terminated {
            return Vec::new();
        }

        self.lines_seen += 1;
        let line_no = self.lines_seen;
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        self.window.push_back((line_no, line.clone()));
        while self.window.len() > self.window_lines {
            self.window.pop_front();
        }

        for armed in self.fatal.iter_mut().filter(|armed| !armed.fired) {
            let text = window_text(&self.window, armed.consumed_upto);
            if let Some(captures) = armed.trigger.captures_in(&text) {
                armed.fired = true;
                self.terminated = true;
                debug!(trigger = armed.trigger.name(), line_no, "fatal marker matched");
                return vec![MatchEvent {
                    trigger: armed.trigger.name().to_string(),
                    effect: TriggerEffect::Fatal,
                    captures,
                    timestamp: Utc::now(),
                    line_no,
                    line,
                }];
            }
        }

        let mut events = Vec::new();
        for armed in self.positive.iter_mut().filter(|armed| !armed.fired) {
            let text = window_text(&self.window, armed.consumed_upto);
            if let Some(captures) = armed.trigger.captures_in(&text) {
                armed.fired = !armed.trigger.repeatable;
                armed.consumed_upto = line_no;
                trace!(trigger = armed.trigger.name(), line_no, "trigger matched");
                events.push(MatchEvent {
                    trigger: armed.trigger.name().to_string(),
                    effect: armed.trigger.effect(),
                    captures,
                    timestamp: Utc::now(),
                    line_no,
                    line: line.clone(),
                });
            }
        }
        events
    }

    /// Consume `lines` on a background task, recording each line in `tail`,
    /// and yield match events in line order. The event stream ends when the
    /// line stream does or a fatal trigger fires.
    pub fn watch(
        mut self,
        mut lines: LineStream,
        tail: OutputTail,
    ) -> mpsc::UnboundedReceiver<MatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                tail.push(&line.text);
                for event in self.feed(&line.text) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                if self.terminated {
                    // Keep recording output for diagnostics.
                    while let Some(line) = lines.recv().await {
                        tail.push(&line.text);
                    }
                    return;
                }
            }
        });
        rx
    }
}

fn window_text(window: &VecDeque<(u64, String)>, consumed_upto: u64) -> String {
    window
        .iter()
        .filter(|(no, _)| *no > consumed_upto)
        .map(|(_, line)| line.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
