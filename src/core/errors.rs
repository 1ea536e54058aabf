// src/core/errors.rs

//! The error vocabulary used internally between the fetch state machine and
//! its collaborators. None of these ever escape the backend-fetch entry
//! point as a `Result` — they are captured at the point of failure, logged,
//! and recovered into a `BoState` transition instead.

use thiserror::Error;

/// The seven error kinds the fetch pipeline can encounter.
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    /// The backend was unreachable, or headers could not be read from it.
    #[error("backend unreachable or header read failed: {0}")]
    Backend(String),

    /// The response's body framing could not be determined (`BS_ERROR`).
    #[error("body status undecidable: {0}")]
    BodyStatus(String),

    /// The storage allocator refused to allocate an object.
    #[error("could not get storage: {0}")]
    Storage(String),

    /// A body filter (gzip/gunzip/esi) failed mid-stream.
    #[error("filter error: {0}")]
    Filter(String),

    /// The backend returned a `Vary` header ferrocache cannot honor safely.
    #[error("illegal vary from backend: {0}")]
    IllegalVary(String),

    /// VCL's `backend_fetch` hook returned ABANDON before the request was sent.
    #[error("fetch abandoned by policy")]
    Abandoned,

    /// VCL's `backend_response` hook requested more retries than `max_retries` allows.
    #[error("too many retries, delivering 503")]
    RetriesExhausted,
}

impl FetchError {
    /// Whether this error should be surfaced as a synthetic 503 (ERROR state)
    /// as opposed to a silent FAILED with no synthetic body (Abandoned).
    pub fn synthesizes_503(&self) -> bool {
        !matches!(self, FetchError::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abandoned_does_not_synthesize() {
        assert!(!FetchError::Abandoned.synthesizes_503());
    }

    #[test]
    fn backend_error_synthesizes() {
        assert!(FetchError::Backend("boom".into()).synthesizes_503());
    }
}
