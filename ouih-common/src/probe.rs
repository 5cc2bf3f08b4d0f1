//! Action probes and response expectations.
//!
//! Probes are blocking; the scenario runner drives them through
//! `spawn_blocking` so a slow request never stalls output collection.
//! [`HttpProbe`] runs its `hyper` connection on a private current-thread
//! runtime for the duration of one call.

use std::fmt::Debug;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{Request, Uri, header};
use hyper_util::rt::TokioIo;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// What an action observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// An external call made by an action step.
pub trait Probe: Send + Sync + Debug {
    /// Short description for logs and reports.
    fn describe(&self) -> String;

    /// Perform the call once. An `Err` counts as a failed trial.
    fn probe(&self) -> HarnessResult<ProbeResponse>;
}

/// Plain HTTP GET, optionally through a client role acting as HTTP proxy.
///
/// Proxied requests carry the absolute URL as request target. Ouinet
/// clients answer `CONNECT` by tunnelling straight to the injector, which
/// would never touch the cache.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    proxy_port: Option<u16>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            proxy_port: None,
            timeout,
        }
    }

    /// Send the request through the proxy listening on `127.0.0.1:port`.
    pub fn via_proxy(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    /// Address to connect to, request target and `Host` header.
    fn route(&self) -> HarnessResult<(String, Uri, String)> {
        let uri = self.url.parse::<Uri>().map_err(|e| self.http_error(e))?;
        if uri.scheme_str() != Some("http") {
            return Err(self.http_error("only http:// URLs are supported"));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| self.http_error("URL has no host"))?
            .clone();

        match self.proxy_port {
            Some(port) => Ok((format!("127.0.0.1:{port}"), uri, authority.to_string())),
            None => {
                let target = uri
                    .path_and_query()
                    .map_or("/", |path| path.as_str())
                    .parse::<Uri>()
                    .map_err(|e| self.http_error(e))?;
                let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
                Ok((addr, target, authority.to_string()))
            }
        }
    }

    async fn fetch(&self) -> HarnessResult<ProbeResponse> {
        let (addr, target, host) = self.route()?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| self.http_error(format!("connect to {addr}: {e}")))?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| self.http_error(e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("probe connection closed: {e}");
            }
        });

        let request = Request::get(target)
            .header(header::HOST, host)
            .body(Empty::<Bytes>::new())
            .map_err(|e| self.http_error(e))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| self.http_error(e))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| self.http_error(e))?
            .to_bytes();
        Ok(ProbeResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn http_error(&self, e: impl std::fmt::Display) -> HarnessError {
        HarnessError::Http {
            url: self.url.clone(),
            message: e.to_string(),
        }
    }
}

impl Probe for HttpProbe {
    fn describe(&self) -> String {
        match self.proxy_port {
            Some(port) => format!("GET {} via 127.0.0.1:{port}", self.url),
            None => format!("GET {}", self.url),
        }
    }

    fn probe(&self) -> HarnessResult<ProbeResponse> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| self.http_error(format!("probe runtime: {e}")))?;
        let response = runtime
            .block_on(async { tokio::time::timeout(self.timeout, self.fetch()).await })
            .map_err(|_| {
                self.http_error(format!(
                    "no response within {}",
                    humantime::format_duration(self.timeout)
                ))
            })??;
        debug!(url = %self.url, status = response.status, bytes = response.body.len(), "http probe answered");
        Ok(response)
    }
}

/// Expected property of a [`ProbeResponse`].
#[derive(Debug, Clone)]
pub enum Expect {
    Status(u16),
    /// Exact body; `{placeholders}` are expanded before checking.
    Body(String),
    BodyMatches(Regex),
    BodyLength(usize),
}

/// Expected vs actual for a failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: String,
    pub actual: String,
}

impl Expect {
    pub fn body_matches(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::BodyMatches(Regex::new(pattern)?))
    }

    pub fn check(&self, response: &ProbeResponse) -> Result<(), Mismatch> {
        let ok = match self {
            Self::Status(status) => response.status == *status,
            Self::Body(body) => response.body == *body,
            Self::BodyMatches(regex) => regex.is_match(&response.body),
            Self::BodyLength(len) => response.body.len() == *len,
        };
        if ok {
            return Ok(());
        }
        let (expected, actual) = match self {
            Self::Status(status) => (
                format!("status {status}"),
                format!("status {}", response.status),
            ),
            Self::Body(body) => (
                format!("body {body:?}"),
                format!("body {:?}", abbreviate(&response.body)),
            ),
            Self::BodyMatches(regex) => (
                format!("body matching /{}/", regex.as_str()),
                format!("body {:?}", abbreviate(&response.body)),
            ),
            Self::BodyLength(len) => (
                format!("body of {len} bytes"),
                format!("body of {} bytes", response.body.len()),
            ),
        };
        Err(Mismatch { expected, actual })
    }
}

/// First mismatch of `expects` against `response`.
pub fn check_all(expects: &[Expect], response: &ProbeResponse) -> Result<(), Mismatch> {
    expects.iter().try_for_each(|expect| expect.check(response))
}

fn abbreviate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> ProbeResponse {
        ProbeResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn expectations_pass_and_fail() {
        let ok = response(200, "abcdefghijklmnopqrst");
        let expects = [
            Expect::Status(200),
            Expect::Body("abcdefghijklmnopqrst".into()),
            Expect::BodyLength(20),
            Expect::body_matches("^[a-z]+$").unwrap(),
        ];
        assert!(check_all(&expects, &ok).is_ok());

        let mismatch = check_all(&expects, &response(502, "bad gateway")).unwrap_err();
        assert_eq!(mismatch.expected, "status 200");
        assert_eq!(mismatch.actual, "status 502");
    }

    #[test]
    fn long_bodies_are_abbreviated() {
        let body = "x".repeat(1000);
        let mismatch = Expect::Body("y".into())
            .check(&response(200, &body))
            .unwrap_err();
        assert!(mismatch.actual.len() < 300);
        assert!(mismatch.actual.ends_with("...\""));
    }

    #[test]
    fn describe_mentions_proxy() {
        let probe =
            HttpProbe::new("http://10.0.0.1:7080/", Duration::from_secs(1)).via_proxy(8081);
        assert_eq!(
            probe.describe(),
            "GET http://10.0.0.1:7080/ via 127.0.0.1:8081"
        );
    }

    async fn one_request_server(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&head).into_owned()
        });
        (port, task)
    }

    const OK_REPLY: &str = "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn proxied_request_uses_absolute_target() {
        let (port, server) = one_request_server(OK_REPLY).await;
        let probe = HttpProbe::new("http://10.0.0.1:7080/page?x=1", Duration::from_secs(5))
            .via_proxy(port);

        let response = tokio::task::spawn_blocking(move || probe.probe())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, ProbeResponse { status: 200, body: "hello".to_string() });

        let head = server.await.unwrap();
        assert!(head.starts_with("GET http://10.0.0.1:7080/page?x=1 HTTP/1.1\r\n"), "{head}");
        assert!(head.to_lowercase().contains("host: 10.0.0.1:7080"), "{head}");
    }

    #[tokio::test]
    async fn direct_request_uses_origin_form() {
        let (port, server) = one_request_server(OK_REPLY).await;
        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/?content=abc"), Duration::from_secs(5));

        let response = tokio::task::spawn_blocking(move || probe.probe())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.body, "hello");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /?content=abc HTTP/1.1\r\n"), "{head}");
    }

    #[test]
    fn non_http_urls_are_rejected() {
        let probe = HttpProbe::new("https://example.org/", Duration::from_secs(1));
        assert!(matches!(probe.probe(), Err(HarnessError::Http { .. })));
    }

    #[test]
    fn connection_refused_is_an_http_error() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/"), Duration::from_secs(2));
        let err = probe.probe().unwrap_err();
        assert!(matches!(err, HarnessError::Http { .. }));
    }
}
