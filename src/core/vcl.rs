// src/core/vcl.rs

//! The VCL policy-hook contract. The original's `(vcl, worker, null,
//! busyobj, workspace)` call convention collapses here to `&BusyObj`/`&mut
//! BusyObj`, since header blocks are owned `Vec`s rather than
//! workspace-arena spans and there is no separate worker handle to thread
//! through.

use crate::core::busyobj::BusyObj;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFetchVerdict {
    Fetch,
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendResponseVerdict {
    Deliver,
    Retry,
}

#[async_trait]
pub trait VclHooks: Send + Sync {
    async fn backend_fetch(&self, bo: &BusyObj) -> BackendFetchVerdict;
    async fn backend_response(&self, bo: &BusyObj) -> BackendResponseVerdict;
    /// Runs the `backend_error` hook against a synthetic 503 response. May
    /// rewrite the BO's `beresp` (via `BusyObj::with_work`); must always
    /// resolve to DELIVER, which this contract expresses by returning `()`
    /// rather than a verdict enum.
    async fn backend_error(&self, bo: &BusyObj);
}

/// The default policy: always fetch, always deliver, no rewriting.
/// Used when no VCL-equivalent is configured, and as the baseline in tests.
pub struct NoopVclHooks;

#[async_trait]
impl VclHooks for NoopVclHooks {
    async fn backend_fetch(&self, _bo: &BusyObj) -> BackendFetchVerdict {
        BackendFetchVerdict::Fetch
    }

    async fn backend_response(&self, _bo: &BusyObj) -> BackendResponseVerdict {
        BackendResponseVerdict::Deliver
    }

    async fn backend_error(&self, _bo: &BusyObj) {}
}

/// Wraps user-supplied closures so integration tests can simulate ABANDON
/// and RETRY without writing a bespoke `VclHooks` impl per scenario.
pub struct ClosureVclHooks<F, R>
where
    F: Fn(&BusyObj) -> BackendFetchVerdict + Send + Sync,
    R: Fn(&BusyObj) -> BackendResponseVerdict + Send + Sync,
{
    pub on_backend_fetch: F,
    pub on_backend_response: R,
}

#[async_trait]
impl<F, R> VclHooks for ClosureVclHooks<F, R>
where
    F: Fn(&BusyObj) -> BackendFetchVerdict + Send + Sync,
    R: Fn(&BusyObj) -> BackendResponseVerdict + Send + Sync,
{
    async fn backend_fetch(&self, bo: &BusyObj) -> BackendFetchVerdict {
        (self.on_backend_fetch)(bo)
    }

    async fn backend_response(&self, bo: &BusyObj) -> BackendResponseVerdict {
        (self.on_backend_response)(bo)
    }

    async fn backend_error(&self, _bo: &BusyObj) {}
}
