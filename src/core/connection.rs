// src/core/connection.rs

//! The connection-pool contract: `fetch_hdr`/`recycle`/`close`, realized as
//! a `BackendConnection` trait with a `reqwest`-backed default
//! implementation. Dispatches are guarded against SSRF the same way the
//! teacher's origin-fetch command guards its own `SecurityConfig`-checked
//! requests.

use crate::config::SecurityConfig;
use crate::core::errors::FetchError;
use crate::core::http_block::HttpBlock;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// The C-style `{0, 1, other}` return convention from `fetch_hdr`, made explicit.
pub enum FetchHdrOutcome {
    /// Headers were read successfully.
    Ok(HttpBlock, BodyReader),
    /// The connection was a reused pooled one and was lost before any bytes
    /// of the response arrived; the caller gets exactly one free retry for this.
    RecycleLost,
    /// Any other failure: unreachable, TLS failure, malformed response, etc.
    Fatal(FetchError),
}

/// A handle to the (possibly still-arriving) response body.
pub struct BodyReader {
    inner: BodyReaderInner,
}

enum BodyReaderInner {
    Live(reqwest::Response),
    Memory(bytes::Bytes),
}

impl BodyReader {
    pub(crate) fn from_response(response: reqwest::Response) -> Self {
        BodyReader {
            inner: BodyReaderInner::Live(response),
        }
    }

    /// Builds a reader over an already-materialized body. Scripted
    /// connections in tests use this to hand the state machine a real
    /// `FetchHdrOutcome::Ok` without an actual HTTP round trip.
    pub fn from_bytes(data: bytes::Bytes) -> Self {
        BodyReader {
            inner: BodyReaderInner::Memory(data),
        }
    }

    pub async fn read_all(self) -> Result<bytes::Bytes, FetchError> {
        match self.inner {
            BodyReaderInner::Live(response) => response
                .bytes()
                .await
                .map_err(|e| FetchError::Backend(e.to_string())),
            BodyReaderInner::Memory(data) => Ok(data),
        }
    }
}

#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn fetch_hdr(&self, bereq: &HttpBlock, url: &str, reused: bool) -> FetchHdrOutcome;
    fn recycle(&self) {}
    fn close(&self) {}
}

/// The default backend connection, backed by `reqwest`.
pub struct HttpBackendConnection {
    client: reqwest::Client,
    security: SecurityConfig,
}

impl HttpBackendConnection {
    pub fn new(security: SecurityConfig, connect_timeout: Duration, request_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Backend(e.to_string()))?;
        Ok(Self { client, security })
    }

    /// Rejects a URL whose host is outside the allowlist, or whose resolved
    /// address is private/loopback/link-local unless explicitly permitted.
    fn check_ssrf(&self, url: &reqwest::Url) -> Result<(), FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Backend("backend URL has no host".to_string()))?;

        if !self.security.domain_allowed(host) {
            return Err(FetchError::Backend(format!(
                "backend domain {host} is not in the allowed_backend_domains list"
            )));
        }

        if !self.security.allow_private_backend_ips {
            if let Ok(ip) = host.parse::<IpAddr>() {
                if is_private_or_local(&ip) {
                    return Err(FetchError::Backend(format!(
                        "backend address {ip} is private/loopback and allow_private_backend_ips is false"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_private_or_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[async_trait]
impl BackendConnection for HttpBackendConnection {
    async fn fetch_hdr(&self, bereq: &HttpBlock, url: &str, reused: bool) -> FetchHdrOutcome {
        let parsed_url = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => return FetchHdrOutcome::Fatal(FetchError::Backend(e.to_string())),
        };

        if let Err(e) = self.check_ssrf(&parsed_url) {
            return FetchHdrOutcome::Fatal(e);
        }

        let method = bereq
            .method
            .as_deref()
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::GET);

        let mut req = self.client.request(method, parsed_url);
        for (name, value) in bereq.iter() {
            req = req.header(name, value);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let mut beresp = HttpBlock::new();
                beresp.status = Some(status.as_u16());
                for (name, value) in resp.headers().iter() {
                    if let Ok(v) = value.to_str() {
                        beresp.append(name.as_str(), v);
                    }
                }
                FetchHdrOutcome::Ok(beresp, BodyReader::from_response(resp))
            }
            Err(e) => {
                if reused && e.is_request() && !e.is_timeout() {
                    FetchHdrOutcome::RecycleLost
                } else {
                    FetchHdrOutcome::Fatal(FetchError::Backend(e.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_ip_by_default() {
        let sec = SecurityConfig {
            allowed_backend_domains: Vec::new(),
            allow_private_backend_ips: false,
        };
        let conn = HttpBackendConnection::new(
            sec,
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();
        let url = reqwest::Url::parse("http://127.0.0.1:8080/").unwrap();
        assert!(conn.check_ssrf(&url).is_err());
    }

    #[test]
    fn allows_private_ip_when_enabled() {
        let sec = SecurityConfig {
            allowed_backend_domains: Vec::new(),
            allow_private_backend_ips: true,
        };
        let conn = HttpBackendConnection::new(
            sec,
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();
        let url = reqwest::Url::parse("http://127.0.0.1:8080/").unwrap();
        assert!(conn.check_ssrf(&url).is_ok());
    }

    #[test]
    fn rejects_domains_outside_allowlist() {
        let sec = SecurityConfig {
            allowed_backend_domains: vec!["example.com".to_string()],
            allow_private_backend_ips: true,
        };
        let conn = HttpBackendConnection::new(
            sec,
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();
        let ok = reqwest::Url::parse("http://example.com/").unwrap();
        let bad = reqwest::Url::parse("http://evil.com/").unwrap();
        assert!(conn.check_ssrf(&ok).is_ok());
        assert!(conn.check_ssrf(&bad).is_err());
    }
}
