// src/config.rs

//! Loads, validates, and resolves the server configuration.
//!
//! Follows the same two-stage shape the rest of this family of services uses:
//! a `RawConfig` that mirrors the TOML file field-for-field with defaults filled
//! in by serde, mapped into a validated `Config` that the rest of the crate
//! actually consumes.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::Path;

/// Raw, unvalidated configuration as deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub log_level: String,
    pub fetch: RawFetchConfig,
    pub security: RawSecurityConfig,
    pub backend: RawBackendConfig,
    pub metrics: RawMetricsConfig,
    pub esi: RawEsiConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            fetch: RawFetchConfig::default(),
            security: RawSecurityConfig::default(),
            backend: RawBackendConfig::default(),
            metrics: RawMetricsConfig::default(),
            esi: RawEsiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawFetchConfig {
    pub http_gzip_support: bool,
    pub shortlived_secs: u64,
    pub max_retries: u32,
    pub fetch_chunksize_kb: u64,
}

impl Default for RawFetchConfig {
    fn default() -> Self {
        Self {
            http_gzip_support: default_http_gzip_support(),
            shortlived_secs: default_shortlived_secs(),
            max_retries: default_max_retries(),
            fetch_chunksize_kb: default_fetch_chunksize_kb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSecurityConfig {
    pub allowed_backend_domains: Vec<String>,
    pub allow_private_backend_ips: bool,
}

impl Default for RawSecurityConfig {
    fn default() -> Self {
        Self {
            allowed_backend_domains: Vec::new(),
            allow_private_backend_ips: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawBackendConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RawBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawMetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for RawMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawEsiConfig {
    pub max_carry_bytes: usize,
}

impl Default for RawEsiConfig {
    fn default() -> Self {
        Self {
            max_carry_bytes: default_max_carry_bytes(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_http_gzip_support() -> bool {
    true
}
fn default_shortlived_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    4
}
fn default_fetch_chunksize_kb() -> u64 {
    128
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_metrics_enabled() -> bool {
    false
}
fn default_metrics_port() -> u16 {
    9_090
}
fn default_max_carry_bytes() -> usize {
    1024
}

/// Validated, ready-to-use configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub fetch: FetchConfig,
    pub security: SecurityConfig,
    pub backend: BackendConfig,
    pub metrics: MetricsConfig,
    pub esi: EsiConfig,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub http_gzip_support: bool,
    pub shortlived: std::time::Duration,
    pub max_retries: u32,
    pub fetch_chunksize_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_backend_domains: Vec<String>,
    pub allow_private_backend_ips: bool,
}

impl SecurityConfig {
    /// Returns `true` if `host` is permitted to be dispatched to as a backend.
    pub fn domain_allowed(&self, host: &str) -> bool {
        self.allowed_backend_domains.is_empty()
            || self
                .allowed_backend_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(host))
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub connect_timeout: std::time::Duration,
    pub request_timeout: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct EsiConfig {
    pub max_carry_bytes: usize,
}

impl Config {
    /// Loads configuration from a TOML file at `path`, validating it before returning.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("FERROCACHE").separator("__"))
            .build()
            .with_context(|| format!("failed to build configuration from {}", path.display()))?;

        let raw: RawConfig = settings
            .try_deserialize()
            .with_context(|| format!("failed to parse configuration at {}", path.display()))?;

        let config = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        Ok(Self {
            log_level: raw.log_level,
            fetch: FetchConfig {
                http_gzip_support: raw.fetch.http_gzip_support,
                shortlived: std::time::Duration::from_secs(raw.fetch.shortlived_secs),
                max_retries: raw.fetch.max_retries,
                fetch_chunksize_bytes: (raw.fetch.fetch_chunksize_kb as usize)
                    .checked_mul(1024)
                    .ok_or_else(|| anyhow!("fetch_chunksize_kb overflows a byte count"))?,
            },
            security: SecurityConfig {
                allowed_backend_domains: raw.security.allowed_backend_domains,
                allow_private_backend_ips: raw.security.allow_private_backend_ips,
            },
            backend: BackendConfig {
                connect_timeout: std::time::Duration::from_millis(raw.backend.connect_timeout_ms),
                request_timeout: std::time::Duration::from_millis(raw.backend.request_timeout_ms),
            },
            metrics: MetricsConfig {
                enabled: raw.metrics.enabled,
                port: raw.metrics.port,
            },
            esi: EsiConfig {
                max_carry_bytes: raw.esi.max_carry_bytes,
            },
        })
    }

    /// Cross-field invariant checks that can't be expressed through serde defaults alone.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.fetch_chunksize_bytes == 0 {
            return Err(anyhow!("fetch.fetch_chunksize_kb must be non-zero"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port must be non-zero when metrics.enabled is true"));
        }
        if self.backend.connect_timeout.is_zero() {
            return Err(anyhow!("backend.connect_timeout_ms must be non-zero"));
        }
        if self.backend.request_timeout.is_zero() {
            return Err(anyhow!("backend.request_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("default configuration must be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.fetch.max_retries, 4);
        assert_eq!(cfg.fetch.fetch_chunksize_bytes, 128 * 1024);
    }

    #[test]
    fn domain_allowlist_empty_means_allow_all() {
        let sec = SecurityConfig {
            allowed_backend_domains: Vec::new(),
            allow_private_backend_ips: false,
        };
        assert!(sec.domain_allowed("example.com"));
    }

    #[test]
    fn domain_allowlist_enforced_when_non_empty() {
        let sec = SecurityConfig {
            allowed_backend_domains: vec!["example.com".to_string()],
            allow_private_backend_ips: false,
        };
        assert!(sec.domain_allowed("Example.com"));
        assert!(!sec.domain_allowed("evil.com"));
    }

    #[test]
    fn zero_chunksize_fails_validation() {
        let mut cfg = Config::default();
        cfg.fetch.fetch_chunksize_bytes = 0;
        assert!(cfg.validate().is_err());
    }
}
