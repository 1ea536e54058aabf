// src/core/http_block.rs

//! An owned, growable HTTP header block.
//!
//! The original source rewrites headers in place inside a workspace arena
//! anchored by `(name, value)` spans. Without that arena, the equivalent is
//! an owned `Vec` of owned `(String, String)` pairs with arena-style
//! builder methods (`filter`, `copy_from`, `set`) so callers never reach
//! in and mutate a single header's bytes directly.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpBlock {
    pub status: Option<u16>,
    pub method: Option<String>,
    pub url: Option<String>,
    headers: Vec<(String, String)>,
}

impl HttpBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a header, allowing duplicates (as real HTTP does).
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Removes all headers named `name` and inserts a single new one with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.headers.push((name, value.into()));
    }

    /// Removes all headers named `name`.
    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Builds `bereq` as a copy of `self` (used for `bereq0` → `bereq`).
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Keeps only headers for which `predicate` returns `true` (the PASS vs
    /// FETCH header-filter policy named in MKBEREQ).
    pub fn filter(&mut self, mut predicate: impl FnMut(&str) -> bool) {
        self.headers.retain(|(n, _)| predicate(n));
    }
}
