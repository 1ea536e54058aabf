// src/core/fetch/entry.rs

//! The backend-fetch entry point (C8): the only thing a caller outside
//! this module needs to drive a fetch. Publishes a fresh `BusyObj` onto
//! the hash index (joining an in-flight one if the key is already BUSY),
//! submits the fetch to the runtime, and blocks the caller only as long
//! as its `FetchMode` requires. Submission and the inline fallback share
//! `run_fetch` so neither path carries logic the other lacks.

use super::state_machine::{self, FetchContext, FetchOutcome};
use crate::config::FetchConfig;
use crate::core::busyobj::{BoState, BusyObj};
use crate::core::connection::BackendConnection;
use crate::core::errors::FetchError;
use crate::core::hash_index::{CacheKey, HashIndex, RefOutcome};
use crate::core::http_block::HttpBlock;
use crate::core::objcore::{CacheObject, Objcore};
use crate::core::storage::Storage;
use crate::core::vcl::VclHooks;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TXID: AtomicU64 = AtomicU64::new(1);

fn next_txid() -> u64 {
    NEXT_TXID.fetch_add(1, Ordering::Relaxed)
}

/// Mirrors the client's delivery intent for the object this fetch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Object must not be stored; served once to the requesting client.
    Pass,
    /// Ordinary cacheable miss/revalidation; the client waits on the fetch.
    Normal,
    /// Background revalidation of a still-fresh-enough object; the client
    /// gets the old object immediately and never waits on this fetch.
    Background,
}

/// The shared backends a fetch needs, held as `Arc<dyn Trait>` so the
/// fetch task's future is `'static` and can be spawned onto the runtime
/// independent of how long the caller's own borrows live.
#[derive(Clone)]
pub struct FetchCollaborators {
    pub hash_index: Arc<dyn HashIndex>,
    pub storage: Arc<dyn Storage>,
    pub transient_storage: Arc<dyn Storage>,
    pub connection: Arc<dyn BackendConnection>,
    pub vcl: Arc<dyn VclHooks>,
    pub config: Arc<FetchConfig>,
    /// Bound on the ESI parser's match-table carry buffer (`esi.max_carry_bytes`).
    pub esi_max_carry_bytes: usize,
}

/// Runs one fetch attempt to completion. Shared verbatim between the
/// spawned path and the submission-failed-so-run-inline path.
async fn run_fetch(
    bo: Arc<BusyObj>,
    collab: FetchCollaborators,
    key: CacheKey,
    url: String,
    stale: Option<CacheObject>,
) -> FetchOutcome {
    let ctx = FetchContext {
        hash_index: collab.hash_index.as_ref(),
        storage: collab.storage.as_ref(),
        transient_storage: collab.transient_storage.as_ref(),
        connection: collab.connection.as_ref(),
        vcl: collab.vcl.as_ref(),
        config: collab.config.as_ref(),
        esi_max_carry_bytes: collab.esi_max_carry_bytes,
        key,
        url,
    };
    let outcome = state_machine::run(bo.clone(), &ctx, stale).await;

    // ABANDON exits before FETCHHDR ever dispatches to the backend, so
    // there is no connection to tear down. Every other exit reached
    // FETCHHDR at least once; hand the connection back to the pool unless
    // something along the way marked it unfit for reuse.
    if !matches!(outcome.error, Some(FetchError::Abandoned)) {
        if bo.snapshot().flags.should_close {
            ctx.connection.close();
        } else {
            ctx.connection.recycle();
        }
    }

    outcome
}

/// Accepts `(bereq0, objcore, oldobj, mode)` and drives a fetch per the
/// wait contract for `mode`. Returns the BO's terminal state; `FetchError`
/// never escapes this boundary — it is only ever observed internally as a
/// state transition (see `error()` in the state machine).
pub async fn backend_fetch(
    bereq0: HttpBlock,
    objcore: Arc<Objcore>,
    oldobj: Option<CacheObject>,
    mode: FetchMode,
    vary_fingerprint: Option<Bytes>,
    key: CacheKey,
    url: String,
    collab: FetchCollaborators,
) -> BoState {
    // References oldobj iff it carries a Last-Modified or ETag; otherwise
    // there is nothing to revalidate against, so it is dropped here rather
    // than threaded through as a dead reference.
    let oldobj = oldobj.filter(|o| {
        o.headers.get("Last-Modified").is_some() || o.headers.get("ETag").is_some()
    });

    let fresh = BusyObj::new(next_txid(), bereq0, objcore.clone());
    fresh.with_work(|w| {
        w.flags.do_pass = matches!(mode, FetchMode::Pass);
        w.vary_fingerprint = vary_fingerprint;
    });

    // Publish onto the hash index before scheduling: a second caller for
    // the same key observes this BO (as Follower) instead of starting a
    // redundant fetch.
    let bo = match collab.hash_index.ref_or_join(key.clone(), fresh.clone()) {
        RefOutcome::Leader(bo) => bo,
        RefOutcome::Follower(existing) => {
            // Someone else already owns this key; the fresh BO this call
            // created is simply dropped, unused and unscheduled.
            wait_for_mode(&existing, mode).await;
            return existing.state();
        }
    };

    // BACKGROUND never references objcore beyond the task's own clone —
    // drop this call's clone immediately rather than holding it across the
    // wait below.
    if mode == FetchMode::Background {
        drop(objcore);
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(run_fetch(bo.clone(), collab, key, url, oldobj));
            match mode {
                FetchMode::Background => {
                    // No separate client-request lifecycle exists in this
                    // crate to publish REQ_DONE later, so the entry point
                    // stands in for that publisher: admitting the
                    // background fetch is itself the point the caller's
                    // synchronous obligation ends.
                    bo.set_state(BoState::ReqDone);
                    drop(task);
                }
                FetchMode::Normal | FetchMode::Pass => {
                    wait_for_mode(&bo, mode).await;
                    match task.await {
                        Ok(outcome) => {
                            tracing::debug!(txid = bo.txid(), state = ?outcome.state, "fetch task finished");
                        }
                        Err(join_err) => {
                            tracing::warn!(error = %join_err, txid = bo.txid(), "fetch task panicked");
                            bo.fetch_objcore.mark_failed();
                            bo.set_state(BoState::Failed);
                        }
                    }
                }
            }
        }
        Err(_) => {
            // Submission failed (no runtime to spawn onto): run inline on
            // this task instead, sharing the same `run_fetch` body.
            let outcome = run_fetch(bo.clone(), collab, key, url, oldobj).await;
            if mode == FetchMode::Background {
                bo.set_state(BoState::ReqDone);
            }
            let _ = outcome;
        }
    }

    let final_state = bo.state();
    debug_assert!(
        final_state != BoState::Failed || bo.fetch_objcore.is_failed(),
        "FAILED state must imply the objcore carries FAILED"
    );
    final_state
}

async fn wait_for_mode(bo: &BusyObj, mode: FetchMode) {
    match mode {
        FetchMode::Background => bo.wait_for(BoState::ReqDone).await,
        FetchMode::Normal | FetchMode::Pass => {
            bo.wait_for(BoState::Fetching).await;
            if !bo.snapshot().flags.do_stream {
                bo.wait_for(BoState::Finished).await;
            }
        }
    }
}
