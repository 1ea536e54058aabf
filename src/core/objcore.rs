// src/core/objcore.rs

//! The cache-index entry a fetch populates. Flags are the ones the hash
//! index and the fetch state machine both need to observe atomically, so
//! they live in a single `AtomicU8` rather than behind a lock.

use crate::core::exp::Exp;
use crate::core::http_block::HttpBlock;
use crate::core::storage::StoredObject;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjcoreFlags: u8 {
        /// A fetch currently owns this slot; cleared exactly once by that fetch.
        const BUSY    = 0b0001;
        /// This object must not be stored (`do_pass`/illegal-Vary coercion).
        const PASS    = 0b0010;
        /// This object is private to one request and never indexed for reuse.
        const PRIVATE = 0b0100;
        /// The fetch that owned this slot failed.
        const FAILED  = 0b1000;
    }
}

/// The cache-index slot a fetch is attached to.
#[derive(Debug)]
pub struct Objcore {
    flags: AtomicU8,
}

impl Objcore {
    pub fn new() -> Self {
        Self {
            flags: AtomicU8::new(ObjcoreFlags::BUSY.bits()),
        }
    }

    pub fn flags(&self) -> ObjcoreFlags {
        ObjcoreFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set(&self, flag: ObjcoreFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flag: ObjcoreFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(ObjcoreFlags::BUSY)
    }

    /// Clears BUSY. Must be called at most once per fetch per the BO lifecycle invariant.
    pub fn unbusy(&self) {
        self.clear(ObjcoreFlags::BUSY);
    }

    pub fn mark_failed(&self) {
        self.set(ObjcoreFlags::FAILED);
    }

    pub fn is_failed(&self) -> bool {
        self.flags().contains(ObjcoreFlags::FAILED)
    }

    pub fn mark_pass(&self) {
        self.set(ObjcoreFlags::PASS);
    }

    pub fn is_private(&self) -> bool {
        self.flags().contains(ObjcoreFlags::PRIVATE)
    }

    pub fn mark_private(&self) {
        self.set(ObjcoreFlags::PRIVATE);
    }
}

impl Default for Objcore {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed cache object: the `Objcore` slot it's indexed under, its
/// response headers, freshness envelope, stored body, and the framing a
/// fetch needs to remember across a conditional refresh (gzip framing
/// offsets, the validated Vary fingerprint it was stored under).
#[derive(Debug)]
pub struct CacheObject {
    pub objcore: Arc<Objcore>,
    pub headers: HttpBlock,
    pub exp: Exp,
    pub body: Arc<StoredObject>,
    pub is_gzip: bool,
    pub gzip_start: u64,
    pub gzip_last: u64,
    pub gzip_stop: u64,
    pub vary: Option<Bytes>,
    /// The VEC program, present only when the object was parsed for ESI.
    pub esi_vec_program: Option<Vec<u8>>,
}

impl CacheObject {
    pub fn len(&self) -> u64 {
        self.body.total_chunk_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-arms expiry at `t_origin` with ttl=grace=keep=0, so the object is
    /// immediately stale and only lingers until references drain — the
    /// terminal state a stale object enters after CONDFETCH has copied its
    /// body into a fresh replacement.
    pub fn rearm_retired(&mut self, t_origin: SystemTime) {
        self.exp = Exp::zero(t_origin);
    }
}
