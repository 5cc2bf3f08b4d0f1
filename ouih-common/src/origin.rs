//! Test origin HTTP server.
//!
//! `/?content=X` echoes `X`; every other request gets the fixed test page.
//! Requests reach it through the client and injector under test, so the
//! address handed to them must not be loopback (injectors may refuse
//! loopback origins).

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OriginSettings;
use crate::error::HarnessResult;

struct OriginState {
    page_body: String,
}

#[derive(Debug, Deserialize)]
struct EchoParams {
    content: Option<String>,
}

fn create_router(page_body: String) -> Router {
    Router::new()
        .route("/", get(echo_handler))
        .fallback(page_handler)
        .with_state(Arc::new(OriginState { page_body }))
}

async fn echo_handler(
    State(state): State<Arc<OriginState>>,
    Query(params): Query<EchoParams>,
) -> String {
    match params.content {
        Some(content) => content,
        None => state.page_body.clone(),
    }
}

async fn page_handler(State(state): State<Arc<OriginState>>) -> String {
    state.page_body.clone()
}

/// A running origin server; stopped explicitly or when dropped.
#[derive(Debug)]
pub struct OriginServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl OriginServer {
    /// Listen on all interfaces at the configured port.
    pub async fn start(settings: &OriginSettings) -> HarnessResult<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.port);
        Self::bind(addr, settings.page_body.clone()).await
    }

    pub async fn bind(addr: SocketAddr, page_body: String) -> HarnessResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, create_router(page_body))
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                });
            if let Err(e) = server.await {
                warn!("origin server error: {e}");
            }
        });
        info!(%addr, "origin server listening");

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(addr = %self.addr, "origin server stopped");
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Host to put in origin URLs: the configured one, else a local
/// non-loopback IPv4 address, else loopback.
pub fn advertise_host(settings: &OriginSettings) -> String {
    if let Some(host) = &settings.advertise_host {
        return host.clone();
    }
    non_loopback_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string())
}

fn non_loopback_ip() -> Option<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("192.0.2.1", 1)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{HttpProbe, Probe};
    use std::time::Duration;

    async fn get(url: String) -> crate::probe::ProbeResponse {
        tokio::task::spawn_blocking(move || {
            HttpProbe::new(url, Duration::from_secs(5)).probe().unwrap()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn echoes_content_and_serves_page() {
        let server = OriginServer::bind("127.0.0.1:0".parse().unwrap(), "PAGE\n".into())
            .await
            .unwrap();
        let base = format!("http://{}", server.addr());

        let echo = get(format!("{base}/?content=abcdefghij")).await;
        assert_eq!(echo.status, 200);
        assert_eq!(echo.body, "abcdefghij");

        let page = get(format!("{base}/qwertyuiop")).await;
        assert_eq!(page.body, "PAGE\n");

        let root = get(format!("{base}/")).await;
        assert_eq!(root.body, "PAGE\n");

        server.stop().await;
    }

    #[test]
    fn configured_host_wins() {
        let settings = OriginSettings {
            advertise_host: Some("10.1.2.3".into()),
            ..OriginSettings::default()
        };
        assert_eq!(advertise_host(&settings), "10.1.2.3");
        assert!(!advertise_host(&OriginSettings::default()).is_empty());
    }
}
