// src/core/busyobj.rs

//! `BusyObj`: the record of one in-flight backend fetch. Many readers may
//! wait on its state reaching a threshold; exactly one task (the fetch
//! task) ever mutates it.
//!
//! The "wait until state >= X" primitive is a `tokio::sync::watch` channel:
//! `Sender::send` publishes every transition, and `Receiver::wait_for`
//! re-evaluates its predicate against the latest value on every change,
//! so it can never busy-wait and is correct under spurious wakeups by
//! construction (there are none to be correct under — `watch` only wakes
//! waiters on an actual value change).

use crate::core::exp::Exp;
use crate::core::http_block::HttpBlock;
use crate::core::objcore::Objcore;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

/// Monotonic fetch lifecycle state. Ordered so `state >= X` comparisons work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoState {
    Invalid = 0,
    ReqDone = 1,
    Committed = 2,
    Fetching = 3,
    Finished = 4,
    Failed = 5,
}

/// Body framing, decided once before any policy hook sees the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    None,
    Length(u64),
    Chunked,
    Eof,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoFlags {
    pub do_pass: bool,
    pub do_stream: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub is_gzip: bool,
    pub is_gunzip: bool,
    pub uncacheable: bool,
    pub should_close: bool,
    pub do_ims: bool,
}

impl BoFlags {
    /// `do_gzip`/`do_gunzip` and `is_gzip`/`is_gunzip` must each be mutually exclusive.
    pub fn is_consistent(&self) -> bool {
        !(self.do_gzip && self.do_gunzip) && !(self.is_gzip && self.is_gunzip)
    }
}

/// The fields a fetch task mutates over the life of an attempt. Owned
/// exclusively by that task and reached only through `BusyObj::with_work`;
/// readers see it only as an immutable snapshot (`BusyObj::snapshot`) taken
/// at a point of their choosing, never as a live reference.
#[derive(Debug, Clone)]
pub struct BoWork {
    pub txid: u64,
    pub bereq0: HttpBlock,
    pub bereq: HttpBlock,
    pub beresp: HttpBlock,
    pub exp: Exp,
    pub body_status: BodyStatus,
    pub flags: BoFlags,
    pub retries: u32,
    pub has_ims_obj: bool,
    /// The caller's Vary fingerprint, carried into the BO by the entry
    /// point so a later `Vary` response from upstream can be checked
    /// against the request variant the client actually asked for.
    pub vary_fingerprint: Option<Bytes>,
}

/// The unit of one in-flight fetch.
pub struct BusyObj {
    pub fetch_objcore: Arc<Objcore>,
    work: Mutex<BoWork>,

    state_tx: watch::Sender<BoState>,
    state_rx: watch::Receiver<BoState>,
}

impl BusyObj {
    pub fn new(txid: u64, bereq0: HttpBlock, fetch_objcore: Arc<Objcore>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(BoState::Invalid);
        Arc::new(Self {
            fetch_objcore,
            work: Mutex::new(BoWork {
                txid,
                bereq0: bereq0.clone(),
                bereq: bereq0,
                beresp: HttpBlock::new(),
                exp: Exp::zero(SystemTime::now()),
                body_status: BodyStatus::None,
                flags: BoFlags::default(),
                retries: 0,
                has_ims_obj: false,
                vary_fingerprint: None,
            }),
            state_tx,
            state_rx,
        })
    }

    /// Runs `f` with exclusive access to the task-owned working fields.
    pub fn with_work<R>(&self, f: impl FnOnce(&mut BoWork) -> R) -> R {
        f(&mut self.work.lock())
    }

    /// Takes an immutable point-in-time copy of the working fields.
    pub fn snapshot(&self) -> BoWork {
        self.work.lock().clone()
    }

    pub fn txid(&self) -> u64 {
        self.work.lock().txid
    }

    pub fn state(&self) -> BoState {
        *self.state_rx.borrow()
    }

    /// Publishes a new state. Panics if the caller attempts to go backwards,
    /// enforcing the "state never decreases" invariant at the only place
    /// state is ever written.
    pub fn set_state(&self, next: BoState) {
        let current = self.state();
        assert!(
            next >= current,
            "BusyObj state must be monotonic: {current:?} -> {next:?}"
        );
        let _ = self.state_tx.send(next);
        tracing::debug!(txid = self.txid(), from = ?current, to = ?next, "bo state transition");
    }

    /// Blocks the calling task until `state() >= target`.
    pub async fn wait_for(&self, target: BoState) {
        let mut rx = self.state_rx.clone();
        if *rx.borrow() >= target {
            return;
        }
        let _ = rx.wait_for(|s| *s >= target).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<BoState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::objcore::Objcore;

    fn make_bo() -> Arc<BusyObj> {
        BusyObj::new(1, HttpBlock::new(), Arc::new(Objcore::new()))
    }

    #[test]
    fn starts_invalid() {
        let bo = make_bo();
        assert_eq!(bo.state(), BoState::Invalid);
    }

    #[test]
    #[should_panic(expected = "monotonic")]
    fn rejects_backwards_transition() {
        let bo = make_bo();
        bo.set_state(BoState::Fetching);
        bo.set_state(BoState::Committed);
    }

    #[tokio::test]
    async fn wait_for_resolves_after_later_transition() {
        let bo = make_bo();
        let waiter = {
            let bo = bo.clone();
            tokio::spawn(async move {
                bo.wait_for(BoState::Fetching).await;
            })
        };
        tokio::task::yield_now().await;
        bo.set_state(BoState::ReqDone);
        bo.set_state(BoState::Committed);
        bo.set_state(BoState::Fetching);
        waiter.await.unwrap();
    }

    #[test]
    fn flag_consistency_checks_mutual_exclusion() {
        let mut flags = BoFlags::default();
        assert!(flags.is_consistent());
        flags.do_gzip = true;
        flags.do_gunzip = true;
        assert!(!flags.is_consistent());
    }

    #[test]
    fn with_work_mutates_and_snapshot_observes() {
        let bo = make_bo();
        bo.with_work(|w| {
            w.retries += 1;
            w.flags.do_esi = true;
        });
        let snap = bo.snapshot();
        assert_eq!(snap.retries, 1);
        assert!(snap.flags.do_esi);
    }

    #[test]
    fn retry_reassigns_txid() {
        let bo = make_bo();
        assert_eq!(bo.txid(), 1);
        bo.with_work(|w| w.txid = 2);
        assert_eq!(bo.txid(), 2);
    }
}
