//! Live state of one scenario run.
//!
//! A [`ScenarioSession`] owns every process and the origin server the
//! scenario started. Each launched role gets a watcher task and a monitor
//! task feeding the shared [`ReadinessTracker`]. [`ScenarioSession::teardown`]
//! stops everything; dropping the session kills whatever is still running.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{HarnessConfig, RoleSpec};
use crate::error::{ConfigError, HarnessError, HarnessResult};
use crate::origin::{self, OriginServer};
use crate::process::{ExitInfo, ProcessHandle, ProcessSpec};
use crate::readiness::ReadinessTracker;
use crate::types::StateKind;
use crate::watcher::{Captures, MatchEvent, PatternWatcher};

/// How long the monitor keeps reading buffered output after an exit.
const EXIT_DRAIN_PERIOD: Duration = Duration::from_millis(500);

struct LiveRole {
    handle: ProcessHandle,
    monitor: JoinHandle<()>,
    port: Option<u16>,
}

impl LiveRole {
    async fn shutdown(self, name: &str, grace: Duration) {
        let status = self.handle.terminate(grace).await;
        if let Err(e) = self.monitor.await {
            warn!(role = name, "monitor task failed: {e}");
        }
        debug!(role = name, %status, "role stopped");
    }
}

pub struct ScenarioSession {
    scenario: String,
    config: Arc<HarnessConfig>,
    dir: PathBuf,
    tracker: Arc<ReadinessTracker>,
    live: BTreeMap<String, LiveRole>,
    origin: Option<OriginServer>,
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for ScenarioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioSession")
            .field("scenario", &self.scenario)
            .field("dir", &self.dir)
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .field("vars", &self.vars)
            .finish_non_exhaustive()
    }
}

impl ScenarioSession {
    /// Create the session and its working directory `dir`.
    pub fn new(scenario: &str, config: Arc<HarnessConfig>, dir: PathBuf) -> HarnessResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let tracker = Arc::new(ReadinessTracker::new(
            config.defaults.max_recoveries,
            config.defaults.tail_lines,
        ));
        Ok(Self {
            scenario: scenario.to_string(),
            config,
            dir,
            tracker,
            live: BTreeMap::new(),
            origin: None,
            vars: BTreeMap::new(),
        })
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tracker(&self) -> &ReadinessTracker {
        &self.tracker
    }

    pub fn role_dir(&self, role: &str) -> PathBuf {
        self.dir.join(role)
    }

    pub fn is_running(&self, role: &str) -> bool {
        self.live.contains_key(role)
    }

    /// Names of roles with a live process.
    pub fn running_roles(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        debug!(var = %name, %value, "scenario variable set");
        self.vars.insert(name, value);
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Spawn `role`, generate its config file and start watching its output.
    pub async fn launch(&mut self, role: &str) -> HarnessResult<()> {
        let spec = self.config.role(role)?.clone();
        if self.live.contains_key(role) {
            return Err(ConfigError::InvalidValue {
                field: format!("roles.{role}"),
                message: "role is already running".to_string(),
            }
            .into());
        }
        if let Some(port) = spec.port
            && let Some((holder, _)) = self.live.iter().find(|(_, live)| live.port == Some(port))
        {
            return Err(HarnessError::PortConflict {
                role: role.to_string(),
                holder: holder.clone(),
                port,
            });
        }

        let role_dir = self.role_dir(role);
        tokio::fs::create_dir_all(&role_dir).await?;
        if let Some(file) = &spec.config_file {
            tokio::fs::write(role_dir.join(file), &spec.config_content).await?;
        }

        let process = self.process_spec(role, &spec, &role_dir)?;
        let triggers = self.config.triggers_for(spec.kind, spec.transport)?;
        let tail = self.tracker.register(role, spec.kind);

        let mut handle = ProcessHandle::start(&process)?;
        self.tracker.mark_started(role)?;

        let lines = handle
            .stream()
            .ok_or_else(|| HarnessError::RoleNotRunning(role.to_string()))?;
        let events = PatternWatcher::new(triggers, self.config.defaults.window_lines)
            .watch(lines, tail);
        let monitor = tokio::spawn(monitor_role(
            role.to_string(),
            Arc::clone(&self.tracker),
            events,
            handle.exit_watch(),
        ));

        info!(scenario = %self.scenario, role, pid = handle.pid(), transport = %spec.transport, "role launched");
        self.live.insert(
            role.to_string(),
            LiveRole {
                handle,
                monitor,
                port: spec.port,
            },
        );
        Ok(())
    }

    fn process_spec(
        &self,
        role: &str,
        spec: &RoleSpec,
        role_dir: &Path,
    ) -> HarnessResult<ProcessSpec> {
        let args = spec
            .args
            .iter()
            .map(|arg| self.render_for(arg, Some(role)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut process = ProcessSpec::new(role, &spec.program)
            .args(args)
            .current_dir(role_dir);
        for (key, value) in &spec.env {
            process = process.env(key, self.render_for(value, Some(role))?);
        }
        Ok(process)
    }

    /// Gracefully stop one role and wait for its monitor to record the exit.
    pub async fn stop(&mut self, role: &str) -> HarnessResult<()> {
        let live = self
            .live
            .remove(role)
            .ok_or_else(|| HarnessError::RoleNotRunning(role.to_string()))?;
        live.shutdown(role, self.config.defaults.grace_period).await;
        Ok(())
    }

    fn ensure_registered(&self, role: &str) -> HarnessResult<()> {
        self.config.role(role)?;
        self.tracker
            .status(role)
            .map(|_| ())
            .map_err(|_| HarnessError::RoleNotRunning(role.to_string()))
    }

    pub async fn await_state(
        &self,
        role: &str,
        state: StateKind,
        timeout: Duration,
    ) -> HarnessResult<Captures> {
        self.ensure_registered(role)?;
        self.tracker.await_state(role, state, timeout).await
    }

    pub async fn await_trigger(
        &self,
        role: &str,
        trigger: &str,
        timeout: Duration,
    ) -> HarnessResult<Captures> {
        self.ensure_registered(role)?;
        self.tracker.await_trigger(role, trigger, timeout).await
    }

    /// Last event of `trigger` for `role`, if it fired.
    pub fn milestone(&self, role: &str, trigger: &str) -> HarnessResult<Option<MatchEvent>> {
        self.ensure_registered(role)?;
        Ok(self.tracker.status(role)?.milestones.get(trigger).cloned())
    }

    pub async fn start_origin(&mut self) -> HarnessResult<()> {
        if self.origin.is_none() {
            self.origin = Some(OriginServer::start(&self.config.origin).await?);
        }
        Ok(())
    }

    /// Read a file the role wrote into its directory, trimmed.
    pub async fn read_role_file(&self, role: &str, file: &str) -> HarnessResult<String> {
        self.config.role(role)?;
        let path = self.role_dir(role).join(file);
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(content.trim().to_string())
    }

    /// Expand `{placeholders}` in a scenario-level template.
    pub fn render(&self, template: &str) -> Result<String, ConfigError> {
        self.render_for(template, None)
    }

    fn render_for(&self, template: &str, current: Option<&str>) -> Result<String, ConfigError> {
        render(template, |key| self.lookup(key, current))
    }

    /// Resolution order: the launching role's own values, scenario
    /// variables, built-ins, then `role.key` (role settings first, trigger
    /// captures second).
    fn lookup(&self, key: &str, current: Option<&str>) -> Option<String> {
        if let Some(role) = current
            && let Some(value) = self.role_value(role, key)
        {
            return Some(value);
        }
        if let Some(value) = self.vars.get(key) {
            return Some(value.clone());
        }
        match key {
            "origin" => return Some(self.origin_authority()),
            "origin_host" => return Some(origin::advertise_host(&self.config.origin)),
            "origin_port" => return Some(self.origin_port().to_string()),
            "test_page_body" => return Some(self.config.origin.page_body.clone()),
            "run_dir" => return Some(self.dir.display().to_string()),
            _ => {}
        }
        let (role, field) = key.split_once('.')?;
        self.role_value(role, field)
            .or_else(|| self.tracker.capture(role, field))
    }

    fn role_value(&self, role: &str, key: &str) -> Option<String> {
        let spec = self.config.roles.get(role)?;
        match key {
            "name" => Some(role.to_string()),
            "port" => spec.port.map(|port| port.to_string()),
            "role_dir" => Some(self.role_dir(role).display().to_string()),
            "config_file" => spec
                .config_file
                .as_ref()
                .map(|file| self.role_dir(role).join(file).display().to_string()),
            _ => None,
        }
    }

    fn origin_port(&self) -> u16 {
        self.origin
            .as_ref()
            .map_or(self.config.origin.port, OriginServer::port)
    }

    fn origin_authority(&self) -> String {
        format!(
            "{}:{}",
            origin::advertise_host(&self.config.origin),
            self.origin_port()
        )
    }

    /// Port of a configured role.
    pub fn role_port(&self, role: &str) -> HarnessResult<u16> {
        self.config.role(role)?.port.ok_or_else(|| {
            ConfigError::InvalidValue {
                field: format!("roles.{role}.port"),
                message: "role has no port".to_string(),
            }
            .into()
        })
    }

    pub fn role_spec(&self, role: &str) -> HarnessResult<&RoleSpec> {
        self.config.role(role)
    }

    /// Stop every live role and the origin server. Graceful teardown sends
    /// SIGTERM first; otherwise processes are killed at once.
    pub async fn teardown(&mut self, graceful: bool) -> usize {
        let grace = if graceful {
            self.config.defaults.grace_period
        } else {
            Duration::ZERO
        };
        let live = std::mem::take(&mut self.live);
        let count = live.len();

        let mut tasks = JoinSet::new();
        for (name, role) in live {
            tasks.spawn(async move {
                role.shutdown(&name, grace).await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(scenario = %self.scenario, "teardown task failed: {e}");
            }
        }

        if let Some(origin) = self.origin.take() {
            origin.stop().await;
        }
        info!(scenario = %self.scenario, processes = count, graceful, "scenario torn down");
        count
    }
}

async fn monitor_role(
    role: String,
    tracker: Arc<ReadinessTracker>,
    mut events: mpsc::UnboundedReceiver<MatchEvent>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) {
    let apply = |event: MatchEvent| {
        if let Err(e) = tracker.apply(&role, &event) {
            warn!(role = %role, "dropping event: {e}");
        }
    };

    let status = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => apply(event),
                None => {
                    let status = exit
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|status| *status);
                    break status;
                }
            },
            changed = exit.changed() => {
                let status = *exit.borrow();
                if changed.is_err() || status.is_some() {
                    break status;
                }
            }
        }
    };

    // Output still in flight may explain the exit.
    let _ = tokio::time::timeout(EXIT_DRAIN_PERIOD, async {
        while let Some(event) = events.recv().await {
            apply(event);
        }
    })
    .await;

    let status = status.unwrap_or_else(ExitInfo::unknown);
    if let Err(e) = tracker.mark_exited(&role, status) {
        warn!(role = %role, "failed to record exit: {e}");
    }
}

/// Expand `{key}` placeholders through `lookup`. Braces that do not enclose
/// a plain key (letters, digits, `_`, `-`, `.`) are left untouched.
pub fn render(
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key = after.find('}').map(|close| &after[..close]).filter(|key| {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        });
        match key {
            Some(key) => {
                let value = lookup(key).ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                    template: template.to_string(),
                    placeholder: key.to_string(),
                })?;
                out.push_str(&value);
                rest = &after[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "port" => Some("7070".into()),
            "cache_injector.ipns_id" => Some("QmRoot".into()),
            _ => None,
        }
    }

    #[test]
    fn render_expands_keys() {
        assert_eq!(
            render("127.0.0.1:{port} --ipns {cache_injector.ipns_id}", lookup).unwrap(),
            "127.0.0.1:7070 --ipns QmRoot"
        );
    }

    #[test]
    fn render_leaves_non_keys_alone() {
        assert_eq!(render("{\"a\": 1} {", lookup).unwrap(), "{\"a\": 1} {");
        assert_eq!(render("{}", lookup).unwrap(), "{}");
    }

    #[test]
    fn render_reports_unresolved() {
        let err = render("--injector-ep {injector_i2p_id}", lookup).unwrap_err();
        match err {
            ConfigError::UnresolvedPlaceholder { placeholder, .. } => {
                assert_eq!(placeholder, "injector_i2p_id")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lookup_prefers_own_role_then_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ScenarioSession::new(
            "lookup",
            Arc::new(HarnessConfig::default()),
            dir.path().to_path_buf(),
        )
        .unwrap();
        session.set_var("injector_i2p_id", "abc.b32.i2p");

        assert_eq!(
            session
                .render_for("{port}", Some(defaults::TCP_CLIENT_NAME))
                .unwrap(),
            defaults::TCP_CLIENT_PORT.to_string()
        );
        assert_eq!(
            session.render("{tcp_injector.port}").unwrap(),
            defaults::TCP_INJECTOR_PORT.to_string()
        );
        assert_eq!(session.render("{injector_i2p_id}").unwrap(), "abc.b32.i2p");
        assert!(
            session
                .render("{tcp_client.role_dir}")
                .unwrap()
                .ends_with("tcp_client")
        );
        assert!(session.render("{port}").is_err());
    }
}
