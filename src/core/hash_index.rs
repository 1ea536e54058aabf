// src/core/hash_index.rs

//! The hash index contract: `ref`/`deref`/`unbusy`/`complete`/`fail`, plus
//! the single-flight join-existing-BO behavior described in the
//! concurrency model. Grounded in the teacher's cache-stampede protection
//! (`DashMap<Bytes, ...>` keyed leader/follower pattern in its own
//! origin-fetch command), adapted to key off a BO's `watch` state instead
//! of a `Shared<BoxFuture>`.

use crate::core::busyobj::BusyObj;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

pub type CacheKey = Bytes;

/// Either a freshly created BO this caller now owns (`Leader`), or an
/// already-running one this caller should join instead of fetching again
/// (`Follower`).
pub enum RefOutcome {
    Leader(Arc<BusyObj>),
    Follower(Arc<BusyObj>),
}

pub trait HashIndex: Send + Sync {
    /// Joins an in-flight BO for `key` if one is BUSY, else installs `fresh`
    /// as the new owner.
    fn ref_or_join(&self, key: CacheKey, fresh: Arc<BusyObj>) -> RefOutcome;

    fn deref(&self, key: &CacheKey);

    fn unbusy(&self, key: &CacheKey);

    fn complete(&self, key: &CacheKey);

    fn fail(&self, key: &CacheKey);
}

/// The default, in-process hash index.
#[derive(Default)]
pub struct MemHashIndex {
    slots: DashMap<CacheKey, Arc<BusyObj>>,
}

impl MemHashIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashIndex for MemHashIndex {
    fn ref_or_join(&self, key: CacheKey, fresh: Arc<BusyObj>) -> RefOutcome {
        match self.slots.entry(key) {
            Entry::Occupied(existing) => {
                let bo = existing.get().clone();
                if bo.fetch_objcore.is_busy() {
                    RefOutcome::Follower(bo)
                } else {
                    RefOutcome::Leader(fresh)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh.clone());
                RefOutcome::Leader(fresh)
            }
        }
    }

    fn deref(&self, key: &CacheKey) {
        self.slots.remove(key);
    }

    fn unbusy(&self, key: &CacheKey) {
        if let Some(bo) = self.slots.get(key) {
            bo.fetch_objcore.unbusy();
        }
    }

    fn complete(&self, key: &CacheKey) {
        self.unbusy(key);
    }

    fn fail(&self, key: &CacheKey) {
        if let Some(bo) = self.slots.get(key) {
            bo.fetch_objcore.mark_failed();
            bo.fetch_objcore.unbusy();
        }
    }
}
