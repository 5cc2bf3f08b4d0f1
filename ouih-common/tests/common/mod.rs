//! Shared fixtures for harness integration tests: shell-scripted roles and
//! a config rooted in a temporary directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use ouih_common::{HarnessConfig, RoleKind, RoleSpec, Transport};

static INIT_LOGGING: Once = Once::new();

/// Route harness logs through the test writer; `RUST_LOG` narrows them.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A role whose process is `sh -c <script>`.
pub fn shell_role(transport: Transport, port: Option<u16>, script: &str) -> RoleSpec {
    RoleSpec {
        kind: RoleKind::Injector,
        transport,
        port,
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string()],
        env: BTreeMap::new(),
        config_file: None,
        config_content: String::new(),
    }
}

/// Default triggers, the given roles only, runs rooted under `root`.
pub fn config_with_roles(
    root: &Path,
    roles: impl IntoIterator<Item = (&'static str, RoleSpec)>,
) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.defaults.run_dir_root = root.to_path_buf();
    config.defaults.grace_period = Duration::from_millis(500);
    config.origin.port = 0;
    config.origin.advertise_host = Some("127.0.0.1".to_string());
    config.roles = roles
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect();
    config
}

/// True while a process with `pid` exists and is not a zombie. Killed
/// grandchildren are reaped by init, which may lag.
pub fn pid_alive(pid: &str) -> bool {
    let exists = std::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success());
    exists && !is_zombie(pid)
}

fn is_zombie(pid: &str) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z'))
    })
}

/// Poll until `pid` is gone; false if it is still alive after `within`.
pub async fn pid_gone_within(pid: &str, within: Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while pid_alive(pid) {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
