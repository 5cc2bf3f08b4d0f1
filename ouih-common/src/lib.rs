//! Ouinet integration harness - common library
//!
//! Launches injector and client processes, watches their output for
//! readiness markers, drives HTTP requests through them against a local
//! origin server and reports each scenario as passed or failed with a
//! classified cause.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod harness;
pub mod origin;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod report;
pub mod scenario;
pub mod scenarios;
pub mod session;
pub mod timeout;
pub mod types;
pub mod watcher;

pub use config::{
    Defaults, EnvOverrides, HarnessConfig, OriginSettings, RoleSpec, TransportSettings,
    TriggerSpec,
};
pub use error::{ConfigError, FailureKind, HarnessError, HarnessResult};
pub use harness::Harness;
pub use origin::OriginServer;
pub use probe::{Expect, HttpProbe, Probe, ProbeResponse};
pub use process::{ExitInfo, OutputLine, OutputSource, ProcessHandle, ProcessSpec};
pub use readiness::{ReadinessTracker, RoleStatus};
pub use report::{FailureReport, Outcome, ScenarioReport, StepRecord};
pub use scenario::{Action, ActionStep, RetryPolicy, Scenario, ScenarioRunner, Step};
pub use session::ScenarioSession;
pub use timeout::{TimeoutPolicy, TimeoutSource};
pub use types::{ProcessState, RoleKind, StateKind, Transport};
pub use watcher::{MatchEvent, PatternWatcher, Trigger, TriggerEffect};
