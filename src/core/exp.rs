// src/core/exp.rs

//! Freshness envelope derivation (RFC 2616 / RFC 7234 style), following the
//! Cache-Control parsing this family of services already does for its own
//! origin-fetch command (max-age / s-maxage / stale-while-revalidate), here
//! expanded to also fall back to `Expires` and to track `grace`/`keep`.

use crate::core::http_block::HttpBlock;
use std::time::{Duration, SystemTime};

/// The freshness envelope attached to a BusyObj once headers are parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exp {
    /// Time-to-live: how long the object is fresh.
    pub ttl: Duration,
    /// Grace: how long a stale object may still be served while revalidating.
    pub grace: Duration,
    /// Keep: how long a stale object is retained in storage for conditional requests.
    pub keep: Duration,
    /// The origin time this envelope is anchored to.
    pub t_origin: SystemTime,
}

impl Exp {
    /// The zeroed envelope used for synthetic/error objects (ttl=grace=keep=0).
    pub fn zero(t_origin: SystemTime) -> Self {
        Self {
            ttl: Duration::ZERO,
            grace: Duration::ZERO,
            keep: Duration::ZERO,
            t_origin,
        }
    }

    /// Derives an `Exp` from a response's headers at time `now`.
    ///
    /// Precedence: `Cache-Control: s-maxage` > `Cache-Control: max-age` >
    /// `Expires` > a default TTL of zero (uncacheable unless policy overrides).
    pub fn derive(beresp: &HttpBlock, now: SystemTime) -> Self {
        let cache_control = beresp.get("Cache-Control").unwrap_or_default();
        let directives = parse_cache_control(cache_control);

        let ttl = directives
            .get("s-maxage")
            .or_else(|| directives.get("max-age"))
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .or_else(|| expires_ttl(beresp, now));

        let ttl = ttl.unwrap_or(Duration::ZERO);

        let grace = directives
            .get("stale-while-revalidate")
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(Duration::ZERO);

        let keep = directives
            .get("stale-if-error")
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(grace);

        if directives.contains_key("no-store") || directives.contains_key("no-cache") {
            return Self {
                ttl: Duration::ZERO,
                grace: Duration::ZERO,
                keep: Duration::ZERO,
                t_origin: now,
            };
        }

        Self {
            ttl,
            grace,
            keep,
            t_origin: now,
        }
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now.duration_since(self.t_origin)
            .map(|elapsed| elapsed < self.ttl)
            .unwrap_or(true)
    }

    /// The envelope a transient-storage salvage takes on: `ttl` clamped to
    /// `shortlived` and `grace`/`keep` zeroed, since a salvaged object lives
    /// only as long as the transient allocator keeps it around and must
    /// never be served stale.
    pub fn clamped_for_salvage(&self, shortlived: Duration) -> Self {
        Self {
            ttl: self.ttl.min(shortlived),
            grace: Duration::ZERO,
            keep: Duration::ZERO,
            t_origin: self.t_origin,
        }
    }
}

fn expires_ttl(beresp: &HttpBlock, now: SystemTime) -> Option<Duration> {
    let expires = beresp.get("Expires")?;
    let expires_at = httpdate::parse_http_date(expires).ok()?;
    expires_at.duration_since(now).ok()
}

/// Parses a `Cache-Control` header into a directive → optional-value map.
/// Directives without a value (e.g. `no-cache`) map to `None`.
fn parse_cache_control(raw: &str) -> std::collections::HashMap<String, Option<String>> {
    let mut out = std::collections::HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                out.insert(
                    k.trim().to_ascii_lowercase(),
                    Some(v.trim().trim_matches('"').to_string()),
                );
            }
            None => {
                out.insert(part.to_ascii_lowercase(), None);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_wins_over_expires() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=60");
        b.append("Expires", "Wed, 21 Oct 2020 07:28:00 GMT");
        let now = SystemTime::now();
        let exp = Exp::derive(&b, now);
        assert_eq!(exp.ttl, Duration::from_secs(60));
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=60, s-maxage=120");
        let exp = Exp::derive(&b, SystemTime::now());
        assert_eq!(exp.ttl, Duration::from_secs(120));
    }

    #[test]
    fn no_store_zeroes_everything() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=60, no-store");
        let exp = Exp::derive(&b, SystemTime::now());
        assert_eq!(exp.ttl, Duration::ZERO);
        assert_eq!(exp.grace, Duration::ZERO);
    }

    #[test]
    fn stale_while_revalidate_becomes_grace() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=10, stale-while-revalidate=30");
        let exp = Exp::derive(&b, SystemTime::now());
        assert_eq!(exp.grace, Duration::from_secs(30));
    }

    #[test]
    fn salvage_clamps_ttl_and_zeroes_grace_and_keep() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=600, stale-while-revalidate=60");
        let exp = Exp::derive(&b, SystemTime::now());
        let salvaged = exp.clamped_for_salvage(Duration::from_secs(10));
        assert_eq!(salvaged.ttl, Duration::from_secs(10));
        assert_eq!(salvaged.grace, Duration::ZERO);
        assert_eq!(salvaged.keep, Duration::ZERO);
    }

    #[test]
    fn salvage_never_extends_ttl_beyond_actual_freshness() {
        let mut b = HttpBlock::new();
        b.append("Cache-Control", "max-age=5");
        let exp = Exp::derive(&b, SystemTime::now());
        let salvaged = exp.clamped_for_salvage(Duration::from_secs(10));
        assert_eq!(salvaged.ttl, Duration::from_secs(5));
    }
}
