//! Built-in scenarios: request echo over TCP and I2P, and cache retrieval
//! through IPFS.

use tracing::debug;

use crate::config::HarnessConfig;
use crate::config::defaults::{
    CACHE_CLIENT_NAMES, CACHE_INJECTOR_NAME, I2P_CLIENT_NAME, I2P_DHT_ADVERTISE_WAIT_PERIOD,
    I2P_ENDPOINT_FILE, I2P_INJECTOR_NAME, IPNS_ID_ANNOUNCED, IPNS_RESOLUTION_STARTED,
    MAX_NO_OF_I2P_CLIENTS, REQUEST_CACHED, RETRIEVED_FROM_CACHE, TCP_CLIENT_NAME,
    TCP_INJECTOR_NAME,
};
use crate::probe::Expect;
use crate::scenario::{Action, ActionStep, RetryPolicy, Scenario, Step};
use crate::types::{StateKind, Transport};

pub const TCP_TRANSPORT: &str = "test_tcp_transport";
pub const I2P_TRANSPORT: &str = "test_i2p_transport";
pub const IPFS_CACHE: &str = "test_ipfs_cache";

/// Built-in scenarios whose roles are all present in `config`.
///
/// A scenario listed in `scenario_timeouts` gets that budget as its overall
/// deadline, besides being the first layer of its readiness timeouts.
pub fn builtin(config: &HarnessConfig) -> Vec<Scenario> {
    [tcp_transport(), i2p_transport(), ipfs_cache()]
        .into_iter()
        .map(|scenario| match config.scenario_timeouts.get(&scenario.name) {
            Some(budget) => scenario.deadline(*budget),
            None => scenario,
        })
        .filter(|scenario| {
            let missing: Vec<_> = scenario
                .roles()
                .into_iter()
                .filter(|role| !config.roles.contains_key(*role))
                .collect();
            if !missing.is_empty() {
                debug!(scenario = %scenario.name, ?missing, "skipping scenario, roles not configured");
            }
            missing.is_empty()
        })
        .collect()
}

fn echo_via(role: &str) -> ActionStep {
    ActionStep::new(
        format!("echo request via {role}"),
        Action::Http {
            via: Some(role.to_string()),
            url: "http://{origin}/?content={content}".to_string(),
        },
    )
    .expect(Expect::Status(200))
    .expect(Expect::Body("{content}".to_string()))
}

fn page_via(role: &str) -> ActionStep {
    ActionStep::new(
        format!("page request via {role}"),
        Action::Http {
            via: Some(role.to_string()),
            url: "http://{origin}/{page}".to_string(),
        },
    )
    .expect(Expect::Status(200))
    .expect(Expect::Body("{test_page_body}".to_string()))
}

/// client --tcp--> injector --> origin, with a unique echo so the response
/// cannot come from a cache.
pub fn tcp_transport() -> Scenario {
    Scenario::new(TCP_TRANSPORT, Transport::Tcp)
        .describe("Unique echo request through a TCP client and injector")
        .steps([
            Step::launch(TCP_INJECTOR_NAME),
            Step::await_state(TCP_INJECTOR_NAME, StateKind::Listening),
            Step::launch(TCP_CLIENT_NAME),
            Step::StartOrigin,
            Step::await_state(TCP_CLIENT_NAME, StateKind::Listening),
            Step::nonce("content"),
        ])
        .step(echo_via(TCP_CLIENT_NAME).retry(RetryPolicy::once()))
}

/// client --i2p--> injector --> origin. Clients whose tunnel never carries a
/// request are replaced, up to a fixed number of clients.
pub fn i2p_transport() -> Scenario {
    Scenario::new(I2P_TRANSPORT, Transport::I2p)
        .describe("Unique echo request through an I2P client and injector")
        .steps([
            Step::launch(I2P_INJECTOR_NAME),
            Step::await_state(I2P_INJECTOR_NAME, StateKind::Ready),
            Step::ReadFile {
                role: I2P_INJECTOR_NAME.to_string(),
                file: I2P_ENDPOINT_FILE.to_string(),
                var: "injector_i2p_id".to_string(),
            },
            // Give the injector time to be advertised on the DHT.
            Step::Sleep(I2P_DHT_ADVERTISE_WAIT_PERIOD),
            Step::StartOrigin,
            Step::Retry {
                label: "i2p client rounds".to_string(),
                rounds: MAX_NO_OF_I2P_CLIENTS,
                steps: vec![
                    Step::launch(I2P_CLIENT_NAME),
                    Step::await_state(I2P_CLIENT_NAME, StateKind::Ready),
                    Step::nonce("content"),
                    echo_via(I2P_CLIENT_NAME).into(),
                ],
                stop_between: vec![I2P_CLIENT_NAME.to_string()],
            },
        ])
}

/// One client fetches a unique page through the injector, which publishes
/// it to the cache; a second, cache-only client must then serve the same
/// page from the cache.
pub fn ipfs_cache() -> Scenario {
    let [first, second] = CACHE_CLIENT_NAMES;
    Scenario::new(IPFS_CACHE, Transport::IpfsCache)
        .describe("Page cached by the injector is served from IPFS to a cache-only client")
        .steps([
            Step::launch(CACHE_INJECTOR_NAME),
            Step::await_state(CACHE_INJECTOR_NAME, StateKind::Listening),
            Step::await_trigger(CACHE_INJECTOR_NAME, IPNS_ID_ANNOUNCED),
            Step::launch(first),
            Step::StartOrigin,
            Step::await_state(first, StateKind::Listening),
            Step::nonce("page"),
        ])
        .step(page_via(first).retry(RetryPolicy::once()))
        .steps([
            Step::await_trigger(CACHE_INJECTOR_NAME, REQUEST_CACHED),
            Step::launch(second),
            Step::await_state(second, StateKind::Ready),
            Step::ReportElapsed {
                label: "IPNS resolution".to_string(),
                role: second.to_string(),
                trigger: IPNS_RESOLUTION_STARTED.to_string(),
            },
        ])
        .step(page_via(second))
        .step(ActionStep::new(
            "served from cache",
            Action::TriggerFired {
                role: second.to_string(),
                trigger: RETRIEVED_FROM_CACHE.to_string(),
            },
        ))
}
