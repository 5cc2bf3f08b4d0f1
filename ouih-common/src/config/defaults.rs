//! Built-in values for a harness run.
//!
//! These reproduce the integration suite's fixture table (ports, readiness
//! markers, trial counts, config file contents). They only seed
//! [`HarnessConfig::default`](super::HarnessConfig); nothing reads them as
//! process-wide state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::{RoleSpec, TransportSettings, TriggerSpec};
use crate::types::{RoleKind, Transport};
use crate::watcher::TriggerEffect;

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const TCP_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(15);
pub const I2P_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(600);
pub const IPFS_CACHE_TIMEOUT: Duration = Duration::from_secs(900);

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WINDOW_LINES: usize = 16;
pub const DEFAULT_TAIL_LINES: usize = 50;
pub const DEFAULT_MAX_RECOVERIES: u32 = 3;

pub const MAX_NO_OF_TRIAL_I2P_REQUESTS: u32 = 5;
pub const I2P_TUNNEL_HEALING_PERIOD: Duration = Duration::from_secs(10);
pub const I2P_DHT_ADVERTISE_WAIT_PERIOD: Duration = Duration::from_secs(60);
pub const MAX_NO_OF_I2P_CLIENTS: u32 = 3;
pub const MAX_NO_OF_TRIAL_IPFS_CACHE_REQUESTS: u32 = 3;
pub const IPFS_CACHE_TRIAL_DELAY: Duration = Duration::from_secs(5);

pub const FATAL_ERROR_INDICATOR_REGEX: &str = r"\[ABORT\](?P<reason>[^\n]*)";
pub const TCP_PORT_READY_REGEX: &str = r"Successfully listening on TCP Port (?P<port>\d+)";
pub const I2P_TUNNEL_READY_REGEX: &str = r"I2P Tunnel has been established";
pub const I2P_TUNNEL_LOST_REGEX: &str = r"I2P Tunnel has been (?:lost|closed)";
pub const IPNS_ID_ANNOUNCE_REGEX: &str = r"IPNS DB: (?P<ipns_id>[A-Za-z0-9]+)";
pub const START_OF_IPNS_RESOLUTION_REGEX: &str = r"resolving IPNS address: ";
pub const IPFS_CACHE_READY_REGEX: &str = r"IPNS ID has been resolved successfully";
pub const REQUEST_CACHED_REGEX: &str = r"Request was successfully published to cache";
pub const RETRIEVED_FROM_CACHE_REGEX: &str = r"Response was retrieved from cache";

pub const FATAL_TRIGGER: &str = "fatal_error";
pub const TCP_PORT_READY: &str = "tcp_port_ready";
pub const I2P_TUNNEL_READY: &str = "i2p_tunnel_ready";
pub const I2P_TUNNEL_LOST: &str = "i2p_tunnel_lost";
pub const IPNS_ID_ANNOUNCED: &str = "ipns_id_announced";
pub const IPNS_RESOLUTION_STARTED: &str = "ipns_resolution_started";
pub const IPFS_CACHE_READY: &str = "ipfs_cache_ready";
pub const REQUEST_CACHED: &str = "request_cached";
pub const RETRIEVED_FROM_CACHE: &str = "retrieved_from_cache";

pub const TCP_INJECTOR_NAME: &str = "tcp_injector";
pub const I2P_INJECTOR_NAME: &str = "i2p_injector";
pub const CACHE_INJECTOR_NAME: &str = "cache_injector";
pub const TCP_CLIENT_NAME: &str = "tcp_client";
pub const I2P_CLIENT_NAME: &str = "i2p_client";
pub const CACHE_CLIENT_NAMES: [&str; 2] = ["cache_client_1", "cache_client_2"];

pub const TCP_INJECTOR_PORT: u16 = 7070;
pub const TEST_HTTP_SERVER_PORT: u16 = 7080;
pub const TCP_CLIENT_PORT: u16 = 8081;
pub const I2P_CLIENT_PORT: u16 = 8081;
pub const CACHE_CLIENT_PORTS: [u16; 2] = [8084, 8085];

pub const INJECTOR_CONF_FILE_NAME: &str = "ouinet-injector.conf";
pub const INJECTOR_CONF_FILE_CONTENT: &str = "open-file-limit = 32768\n";
pub const CLIENT_CONF_FILE_NAME: &str = "ouinet-client.conf";
pub const CLIENT_CONF_FILE_CONTENT: &str = "open-file-limit = 4096\n";
/// File the injector writes its I2P endpoint into, relative to its repo.
pub const I2P_ENDPOINT_FILE: &str = "endpoint-i2p";

pub const TEST_PAGE_BODY: &str = "<html><body>TESTPAGE</body></html>\n";
pub const RESPONSE_LENGTH: usize = 20;

pub const DEFAULT_INJECTOR_PROGRAM: &str = "injector";
pub const DEFAULT_CLIENT_PROGRAM: &str = "client";

pub fn default_run_dir_root() -> PathBuf {
    std::env::temp_dir().join("ouih_runs")
}

pub fn default_transports() -> BTreeMap<String, TransportSettings> {
    let mut transports = BTreeMap::new();
    transports.insert(
        Transport::Tcp.as_str().to_string(),
        TransportSettings {
            timeout: TCP_TRANSPORT_TIMEOUT,
            max_trials: 1,
            trial_delay: Duration::ZERO,
        },
    );
    transports.insert(
        Transport::I2p.as_str().to_string(),
        TransportSettings {
            timeout: I2P_TRANSPORT_TIMEOUT,
            max_trials: MAX_NO_OF_TRIAL_I2P_REQUESTS,
            trial_delay: I2P_TUNNEL_HEALING_PERIOD,
        },
    );
    transports.insert(
        Transport::IpfsCache.as_str().to_string(),
        TransportSettings {
            timeout: IPFS_CACHE_TIMEOUT,
            max_trials: MAX_NO_OF_TRIAL_IPFS_CACHE_REQUESTS,
            trial_delay: IPFS_CACHE_TRIAL_DELAY,
        },
    );
    transports
}

/// Per-scenario readiness budgets.
pub fn default_scenario_timeouts() -> BTreeMap<String, Duration> {
    BTreeMap::from([
        ("test_i2p_transport".to_string(), Duration::from_secs(300)),
        ("test_tcp_transport".to_string(), Duration::from_secs(15)),
        ("test_ipfs_cache".to_string(), Duration::from_secs(900)),
    ])
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn injector(transport: Transport, port: Option<u16>, args: &[&str]) -> RoleSpec {
    RoleSpec {
        kind: RoleKind::Injector,
        transport,
        port,
        program: PathBuf::from(DEFAULT_INJECTOR_PROGRAM),
        args: strings(args),
        env: BTreeMap::new(),
        config_file: Some(INJECTOR_CONF_FILE_NAME.to_string()),
        config_content: INJECTOR_CONF_FILE_CONTENT.to_string(),
    }
}

fn client(kind: RoleKind, transport: Transport, port: u16, args: &[&str]) -> RoleSpec {
    RoleSpec {
        kind,
        transport,
        port: Some(port),
        program: PathBuf::from(DEFAULT_CLIENT_PROGRAM),
        args: strings(args),
        env: BTreeMap::new(),
        config_file: Some(CLIENT_CONF_FILE_NAME.to_string()),
        config_content: CLIENT_CONF_FILE_CONTENT.to_string(),
    }
}

pub fn default_roles() -> BTreeMap<String, RoleSpec> {
    let tcp_listen = [
        "--repo",
        "{role_dir}",
        "--listen-on-i2p",
        "false",
        "--listen-on-tcp",
        "127.0.0.1:{port}",
    ];

    let mut roles = BTreeMap::new();
    roles.insert(
        TCP_INJECTOR_NAME.to_string(),
        injector(Transport::Tcp, Some(TCP_INJECTOR_PORT), &tcp_listen),
    );
    roles.insert(
        I2P_INJECTOR_NAME.to_string(),
        injector(
            Transport::I2p,
            None,
            &["--repo", "{role_dir}", "--listen-on-i2p", "true"],
        ),
    );
    roles.insert(
        CACHE_INJECTOR_NAME.to_string(),
        injector(Transport::IpfsCache, Some(TCP_INJECTOR_PORT), &tcp_listen),
    );
    roles.insert(
        TCP_CLIENT_NAME.to_string(),
        client(
            RoleKind::TcpClient,
            Transport::Tcp,
            TCP_CLIENT_PORT,
            &[
                "--repo",
                "{role_dir}",
                "--disable-origin-access",
                "--disable-cache",
                "--listen-on-tcp",
                "127.0.0.1:{port}",
                "--injector-ep",
                "127.0.0.1:{tcp_injector.port}",
                "http://localhost/",
            ],
        ),
    );
    roles.insert(
        I2P_CLIENT_NAME.to_string(),
        client(
            RoleKind::I2pClient,
            Transport::I2p,
            I2P_CLIENT_PORT,
            &[
                "--repo",
                "{role_dir}",
                "--disable-origin-access",
                "--disable-cache",
                "--listen-on-tcp",
                "127.0.0.1:{port}",
                "--injector-ep",
                "{injector_i2p_id}",
                "http://localhost/",
            ],
        ),
    );
    roles.insert(
        CACHE_CLIENT_NAMES[0].to_string(),
        client(
            RoleKind::TcpClient,
            Transport::IpfsCache,
            CACHE_CLIENT_PORTS[0],
            &[
                "--repo",
                "{role_dir}",
                "--disable-origin-access",
                "--disable-proxy-access",
                "--disable-cache",
                "--listen-on-tcp",
                "127.0.0.1:{port}",
                "--injector-ep",
                "127.0.0.1:{cache_injector.port}",
                "http://localhost/",
            ],
        ),
    );
    roles.insert(
        CACHE_CLIENT_NAMES[1].to_string(),
        client(
            RoleKind::CacheClient,
            Transport::IpfsCache,
            CACHE_CLIENT_PORTS[1],
            &[
                "--repo",
                "{role_dir}",
                "--disable-origin-access",
                "--disable-proxy-access",
                "--listen-on-tcp",
                "127.0.0.1:{port}",
                "--default-index",
                "btree",
                "--injector-ipns",
                "{cache_injector.ipns_id}",
                "http://localhost/",
            ],
        ),
    );
    roles
}

fn trigger(
    name: &str,
    pattern: &str,
    effect: TriggerEffect,
    roles: &[RoleKind],
    transports: &[Transport],
) -> TriggerSpec {
    TriggerSpec {
        name: name.to_string(),
        pattern: pattern.to_string(),
        effect,
        roles: roles.to_vec(),
        transports: transports.to_vec(),
        repeatable: false,
    }
}

pub fn default_triggers() -> Vec<TriggerSpec> {
    let mut i2p_ready = trigger(
        I2P_TUNNEL_READY,
        I2P_TUNNEL_READY_REGEX,
        TriggerEffect::Ready,
        &[],
        &[Transport::I2p],
    );
    i2p_ready.repeatable = true;
    let mut i2p_lost = trigger(
        I2P_TUNNEL_LOST,
        I2P_TUNNEL_LOST_REGEX,
        TriggerEffect::Degrade,
        &[],
        &[Transport::I2p],
    );
    i2p_lost.repeatable = true;

    vec![
        trigger(
            FATAL_TRIGGER,
            FATAL_ERROR_INDICATOR_REGEX,
            TriggerEffect::Fatal,
            &[],
            &[],
        ),
        trigger(
            TCP_PORT_READY,
            TCP_PORT_READY_REGEX,
            TriggerEffect::Listening,
            &[],
            &[Transport::Tcp, Transport::IpfsCache],
        ),
        i2p_ready,
        i2p_lost,
        trigger(
            IPNS_ID_ANNOUNCED,
            IPNS_ID_ANNOUNCE_REGEX,
            TriggerEffect::Milestone,
            &[RoleKind::Injector],
            &[Transport::IpfsCache],
        ),
        trigger(
            REQUEST_CACHED,
            REQUEST_CACHED_REGEX,
            TriggerEffect::Milestone,
            &[RoleKind::Injector],
            &[Transport::IpfsCache],
        ),
        trigger(
            IPNS_RESOLUTION_STARTED,
            START_OF_IPNS_RESOLUTION_REGEX,
            TriggerEffect::Milestone,
            &[RoleKind::CacheClient],
            &[Transport::IpfsCache],
        ),
        trigger(
            IPFS_CACHE_READY,
            IPFS_CACHE_READY_REGEX,
            TriggerEffect::Ready,
            &[RoleKind::CacheClient],
            &[Transport::IpfsCache],
        ),
        trigger(
            RETRIEVED_FROM_CACHE,
            RETRIEVED_FROM_CACHE_REGEX,
            TriggerEffect::Milestone,
            &[RoleKind::CacheClient],
            &[Transport::IpfsCache],
        ),
    ]
}
