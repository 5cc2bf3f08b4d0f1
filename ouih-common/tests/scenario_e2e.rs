//! End-to-end scenario runs against shell-scripted roles.
//!
//! Validates:
//!   - readiness captures flowing into reports
//!   - bounded retries of action steps and retry rounds
//!   - fail-fast classification of fatal markers and early exits
//!   - timeouts honoured at their boundary
//!   - the IPFS cache flow, with captures feeding a later role's arguments
//!   - teardown leaving no process behind, forked helpers included

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use common::{config_with_roles, init_test_logging, pid_alive, pid_gone_within, shell_role};
use ouih_common::config::defaults::{
    CACHE_CLIENT_NAMES, CACHE_INJECTOR_NAME, RETRIEVED_FROM_CACHE_REGEX,
};
use ouih_common::{
    Action, ActionStep, Expect, FailureKind, Harness, HarnessConfig, HarnessResult, OriginServer,
    Probe, ProbeResponse, RetryPolicy, RoleKind, Scenario, StateKind, Step, Transport, scenarios,
};

// ===========================================================================
// Fixtures
// ===========================================================================

const LISTENER: &str = r#"echo "starting up"; echo "Successfully listening on TCP Port {port}"; exec sleep 30"#;

/// Answers 503 until the `succeed_on`-th call.
#[derive(Debug)]
struct CountingProbe {
    calls: AtomicU32,
    succeed_on: u32,
}

impl CountingProbe {
    fn new(succeed_on: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            succeed_on,
        })
    }
}

impl Probe for CountingProbe {
    fn describe(&self) -> String {
        format!("counting probe (succeeds on call {})", self.succeed_on)
    }

    fn probe(&self) -> HarnessResult<ProbeResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if call >= self.succeed_on { 200 } else { 503 };
        Ok(ProbeResponse {
            status,
            body: String::new(),
        })
    }
}

/// Answers 200 every time; the body only carries the cache marker from the
/// `cached_from`-th call on.
#[derive(Debug)]
struct WarmingCacheProbe {
    calls: AtomicU32,
    cached_from: u32,
}

impl Probe for WarmingCacheProbe {
    fn describe(&self) -> String {
        format!("warming cache (cached from call {})", self.cached_from)
    }

    fn probe(&self) -> HarnessResult<ProbeResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let body = if call >= self.cached_from {
            "Response was retrieved from cache"
        } else {
            "Response was fetched from the origin"
        };
        Ok(ProbeResponse {
            status: 200,
            body: body.to_string(),
        })
    }
}

fn counting_step(probe: &Arc<CountingProbe>, policy: RetryPolicy) -> ActionStep {
    ActionStep::new("counting probe", Action::Probe(probe.clone()))
        .expect(Expect::Status(200))
        .retry(policy)
}

// ===========================================================================
// Readiness
// ===========================================================================

#[tokio::test]
async fn listening_port_is_captured_in_report() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [("echo_injector", shell_role(Transport::Tcp, Some(7070), LISTENER))],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("listening", Transport::Tcp)
        .step(Step::launch("echo_injector"))
        .step(Step::await_state("echo_injector", StateKind::Listening));
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.captures["echo_injector.port"], "7070");
    assert_eq!(report.steps.len(), 2);
}

#[tokio::test]
async fn echo_through_origin_matches_nonce() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(config_with_roles(root.path(), [])).unwrap();

    let scenario = Scenario::new("origin_echo", Transport::Tcp)
        .step(Step::StartOrigin)
        .step(Step::nonce("content"))
        .step(
            ActionStep::new(
                "direct echo",
                Action::Http {
                    via: None,
                    url: "http://{origin}/?content={content}".to_string(),
                },
            )
            .expect(Expect::Status(200))
            .expect(Expect::Body("{content}".to_string())),
        );
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.captures["content"].len(), 20);
}

// ===========================================================================
// Retries
// ===========================================================================

#[tokio::test]
async fn action_succeeds_on_third_trial() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(config_with_roles(root.path(), [])).unwrap();

    let probe = CountingProbe::new(3);
    let scenario = Scenario::new("flaky_probe", Transport::I2p).step(counting_step(
        &probe,
        RetryPolicy::new(3, Duration::from_millis(10)),
    ));
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_trials_report_assertion_failure() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(config_with_roles(root.path(), [])).unwrap();

    let probe = CountingProbe::new(10);
    let scenario = Scenario::new("hopeless_probe", Transport::I2p).step(counting_step(
        &probe,
        RetryPolicy::new(2, Duration::from_millis(10)),
    ));
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::AssertionFailure);
    assert_eq!(failure.step, Some(0));
    assert!(failure.message.contains("503"), "{}", failure.message);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert!(!harness.all_passed());
}

#[tokio::test]
async fn retry_round_relaunches_role() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [("flaky_client", shell_role(Transport::Tcp, Some(7171), LISTENER))],
    );
    let mut harness = Harness::new(config).unwrap();

    let probe = CountingProbe::new(2);
    let scenario = Scenario::new("rounds", Transport::Tcp).step(Step::Retry {
        label: "client rounds".to_string(),
        rounds: 3,
        steps: vec![
            Step::launch("flaky_client"),
            Step::await_state("flaky_client", StateKind::Listening),
            counting_step(&probe, RetryPolicy::once()).into(),
        ],
        stop_between: vec!["flaky_client".to_string()],
    });
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.steps.last().unwrap().attempts, 2);
}

#[tokio::test]
async fn cache_marker_in_body_on_third_trial() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(config_with_roles(root.path(), [])).unwrap();

    let probe = Arc::new(WarmingCacheProbe {
        calls: AtomicU32::new(0),
        cached_from: 3,
    });
    let step = ActionStep::new("page from cache", Action::Probe(probe.clone()))
        .expect(Expect::Status(200))
        .expect(Expect::body_matches(RETRIEVED_FROM_CACHE_REGEX).unwrap())
        .retry(RetryPolicy::new(3, Duration::from_millis(10)));
    let report = harness
        .run(&Scenario::new("warming_cache", Transport::IpfsCache).step(step))
        .await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
}

// ===========================================================================
// IPFS cache flow
// ===========================================================================

const CACHE_INJECTOR: &str = r#"echo "Successfully listening on TCP Port {port}"; echo "IPNS DB: QmStandIn42"; echo "Request was successfully published to cache"; exec sleep 30"#;

const CACHE_READER: &str = r#"echo "{cache_injector.ipns_id}" > ipns; echo "resolving IPNS address: {cache_injector.ipns_id}"; echo "IPNS ID has been resolved successfully"; echo "Response was retrieved from cache"; exec sleep 30"#;

fn role_of_kind(kind: RoleKind, port: u16, script: &str) -> ouih_common::RoleSpec {
    let mut role = shell_role(Transport::IpfsCache, Some(port), script);
    role.kind = kind;
    role
}

#[tokio::test]
async fn ipfs_cache_flow_against_stand_in_roles() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    // Page servers stand in for the clients' proxy ports: they answer the
    // absolute-form page request with the test page.
    let page_body = HarnessConfig::default().origin.page_body;
    let loopback = "127.0.0.1:0".parse().unwrap();
    let seeding_proxy = OriginServer::bind(loopback, page_body.clone()).await.unwrap();
    let reading_proxy = OriginServer::bind(loopback, page_body).await.unwrap();

    let [seeder, reader] = CACHE_CLIENT_NAMES;
    let config = config_with_roles(
        root.path(),
        [
            (
                CACHE_INJECTOR_NAME,
                role_of_kind(RoleKind::Injector, 7575, CACHE_INJECTOR),
            ),
            (
                seeder,
                role_of_kind(RoleKind::TcpClient, seeding_proxy.port(), LISTENER),
            ),
            (
                reader,
                role_of_kind(RoleKind::CacheClient, reading_proxy.port(), CACHE_READER),
            ),
        ],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = scenarios::ipfs_cache();
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.steps.len(), scenario.steps.len());
    assert_eq!(report.captures["cache_injector.ipns_id"], "QmStandIn42");
    assert_eq!(report.captures["page"].len(), 20);

    // The injector's capture reached the second client's command line.
    let rendered = harness
        .run_dir()
        .join(scenarios::IPFS_CACHE)
        .join(reader)
        .join("ipns");
    assert_eq!(std::fs::read_to_string(rendered).unwrap().trim(), "QmStandIn42");
}

#[tokio::test]
async fn cache_flow_reports_missing_marker() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [(
            "reader",
            role_of_kind(
                RoleKind::CacheClient,
                7576,
                r#"echo "IPNS ID has been resolved successfully"; exec sleep 30"#,
            ),
        )],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("missing_marker", Transport::IpfsCache)
        .step(Step::launch("reader"))
        .step(Step::await_state("reader", StateKind::Ready))
        .step(Step::ReportElapsed {
            label: "IPNS resolution".to_string(),
            role: "reader".to_string(),
            trigger: "ipns_resolution_started".to_string(),
        });
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::AssertionFailure);
    assert_eq!(failure.step, Some(2));
    assert!(failure.message.contains("ipns_resolution_started"), "{}", failure.message);
}

#[tokio::test]
async fn read_file_feeds_later_requests() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [(
            "writer",
            shell_role(
                Transport::I2p,
                None,
                r#"echo "abcdefghij" > endpoint-i2p; echo "I2P Tunnel has been established"; exec sleep 30"#,
            ),
        )],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("read_file", Transport::I2p)
        .step(Step::launch("writer"))
        .step(Step::await_state("writer", StateKind::Ready))
        .step(Step::ReadFile {
            role: "writer".to_string(),
            file: "endpoint-i2p".to_string(),
            var: "content".to_string(),
        })
        .step(Step::StartOrigin)
        .step(
            ActionStep::new(
                "echo endpoint",
                Action::Http {
                    via: None,
                    url: "http://{origin}/?content={content}".to_string(),
                },
            )
            .expect(Expect::Body("{content}".to_string())),
        );
    let report = harness.run(&scenario).await;

    assert!(report.passed(), "{}", report.summary());
    assert_eq!(report.captures["content"], "abcdefghij");
}

// ===========================================================================
// Failure classification
// ===========================================================================

#[tokio::test]
async fn fatal_marker_fails_fast() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [(
            "doomed",
            shell_role(
                Transport::Tcp,
                None,
                r#"echo "loading"; echo "[ABORT] disk full"; exec sleep 30"#,
            ),
        )],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("fatal", Transport::Tcp)
        .step(Step::launch("doomed"))
        .step(Step::await_state_within(
            "doomed",
            StateKind::Listening,
            Duration::from_secs(20),
        ));
    let started = Instant::now();
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::FatalMarkerDetected);
    assert_eq!(failure.step, Some(1));
    assert!(failure.message.contains("disk full"), "{}", failure.message);
    assert!(failure.tail.iter().any(|line| line.contains("[ABORT]")));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn exit_before_target_is_process_exited() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [("quitter", shell_role(Transport::Tcp, None, "echo bye; exit 3"))],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("early_exit", Transport::Tcp)
        .step(Step::launch("quitter"))
        .step(Step::await_state_within(
            "quitter",
            StateKind::Listening,
            Duration::from_secs(20),
        ));
    let started = Instant::now();
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::ProcessExited);
    assert!(failure.tail.iter().any(|line| line == "bye"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn silent_role_times_out_at_boundary() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [("mute", shell_role(Transport::Tcp, None, "exec sleep 30"))],
    );
    let mut harness = Harness::new(config).unwrap();

    let timeout = Duration::from_millis(300);
    let scenario = Scenario::new("silent", Transport::Tcp)
        .step(Step::launch("mute"))
        .step(Step::await_state_within("mute", StateKind::Listening, timeout));
    let started = Instant::now();
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::PatternMatchTimeout);
    assert_eq!(failure.timeout_ms, Some(300));
    assert!(failure.elapsed_ms.unwrap() >= 300);
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn second_role_on_same_port_is_rejected() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with_roles(
        root.path(),
        [
            ("first", shell_role(Transport::Tcp, Some(7272), LISTENER)),
            ("second", shell_role(Transport::Tcp, Some(7272), LISTENER)),
        ],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("conflict", Transport::Tcp)
        .step(Step::launch("first"))
        .step(Step::launch("second"));
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::Configuration);
    assert_eq!(failure.step, Some(1));
    assert!(failure.message.contains("7272"), "{}", failure.message);
}

#[tokio::test]
async fn deadline_caps_whole_scenario() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(config_with_roles(root.path(), [])).unwrap();

    let scenario = Scenario::new("slow", Transport::Tcp)
        .step(Step::Sleep(Duration::from_secs(30)))
        .deadline(Duration::from_millis(200));
    let report = harness.run(&scenario).await;

    let failure = report.failure().expect("scenario should fail");
    assert_eq!(failure.kind, FailureKind::ScenarioTimeout);
    assert_eq!(failure.step, Some(0));
    assert_eq!(failure.timeout_ms, Some(200));
}

// ===========================================================================
// Teardown
// ===========================================================================

#[tokio::test]
async fn teardown_leaves_no_processes() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let script = r#"echo $$ > pid; echo "Successfully listening on TCP Port {port}"; exec sleep 30"#;
    let config = config_with_roles(
        root.path(),
        [
            ("alpha", shell_role(Transport::Tcp, Some(7373), script)),
            ("beta", shell_role(Transport::Tcp, Some(7374), script)),
        ],
    );
    let mut harness = Harness::new(config).unwrap();

    let scenario = Scenario::new("teardown", Transport::Tcp)
        .step(Step::launch("alpha"))
        .step(Step::launch("beta"))
        .step(Step::await_state("alpha", StateKind::Listening))
        .step(Step::await_state("beta", StateKind::Listening));
    let report = harness.run(&scenario).await;
    assert!(report.passed(), "{}", report.summary());

    for role in ["alpha", "beta"] {
        let pid_file = harness.run_dir().join("teardown").join(role).join("pid");
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(!pid_alive(pid.trim()), "{role} (pid {}) survived teardown", pid.trim());
    }
}

#[tokio::test]
async fn teardown_reaches_forked_helpers() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let script = r#"sleep 30 & echo $! > child; echo "Successfully listening on TCP Port {port}"; wait"#;
    let config = config_with_roles(
        root.path(),
        [
            ("graceful", shell_role(Transport::Tcp, Some(7474), script)),
            ("abrupt", shell_role(Transport::Tcp, Some(7475), script)),
        ],
    );
    let mut harness = Harness::new(config).unwrap();

    let passing = Scenario::new("graceful", Transport::Tcp)
        .step(Step::launch("graceful"))
        .step(Step::await_state("graceful", StateKind::Listening));
    // A failed scenario kills its roles without a grace period.
    let failing = Scenario::new("abrupt", Transport::Tcp)
        .step(Step::launch("abrupt"))
        .step(Step::await_state("abrupt", StateKind::Listening))
        .step(Step::AwaitTrigger {
            role: "abrupt".to_string(),
            trigger: "never_printed".to_string(),
            timeout: Some(Duration::from_millis(100)),
        });

    assert!(harness.run(&passing).await.passed());
    assert!(!harness.run(&failing).await.passed());

    for role in ["graceful", "abrupt"] {
        let child_file = harness.run_dir().join(role).join(role).join("child");
        let child = std::fs::read_to_string(&child_file).unwrap();
        assert!(
            pid_gone_within(child.trim(), Duration::from_secs(2)).await,
            "{role}'s forked helper (pid {}) survived teardown",
            child.trim()
        );
    }
}
