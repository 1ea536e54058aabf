// src/core/storage.rs

//! The storage allocator contract: `new_object`/`alloc_chunk`/`trim`/`free`.
//! Generalizes the teacher's `CacheBody::InMemory(Bytes)` representation
//! into a chunked object a streaming fetch can append to incrementally.

use crate::core::errors::FetchError;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// A single allocated chunk of a stored object.
#[derive(Debug)]
pub struct Chunk {
    buf: Mutex<BytesMut>,
    sealed: std::sync::atomic::AtomicBool,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(BytesMut::with_capacity(capacity)),
            sealed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Current length. Grows monotonically until `seal` is called, matching
    /// the streaming-observer contract in the concurrency model.
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend(&self, data: &[u8]) {
        assert!(
            !self.sealed.load(std::sync::atomic::Ordering::Acquire),
            "cannot extend a sealed chunk"
        );
        self.buf.lock().extend_from_slice(data);
    }

    pub fn seal(&self) {
        self.sealed.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn snapshot(&self) -> Bytes {
        self.buf.lock().clone().freeze()
    }
}

/// A storage object: an ordered sequence of chunks plus a declared total length.
#[derive(Debug, Default)]
pub struct StoredObject {
    chunks: Mutex<Vec<Arc<Chunk>>>,
    declared_len: std::sync::atomic::AtomicU64,
}

impl StoredObject {
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.lock().clone()
    }

    pub fn total_chunk_len(&self) -> u64 {
        self.chunks.lock().iter().map(|c| c.len() as u64).sum()
    }

    pub fn declared_len(&self) -> u64 {
        self.declared_len.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_declared_len(&self, len: u64) {
        self.declared_len.store(len, std::sync::atomic::Ordering::Release);
    }

    pub fn trim(&self, new_len: u64) {
        self.set_declared_len(new_len);
    }
}

/// The storage allocator contract. Implementations may refuse allocation
/// (surfaced as `FetchError::Storage`), triggering the FETCH salvage path.
pub trait Storage: Send + Sync {
    /// Allocates a new object, sized from a hint. Returns `None` if refused.
    fn new_object(&self, size_hint: u64) -> Option<Arc<StoredObject>>;

    /// Allocates the next chunk for `object`, sized up to `remaining` bytes
    /// (or the storage's own chunk size, whichever is smaller).
    fn alloc_chunk(&self, object: &StoredObject, remaining: u64) -> Option<Arc<Chunk>>;

    fn free(&self, object: Arc<StoredObject>) {
        drop(object);
    }
}

/// The default, in-memory storage backend.
pub struct MemStorage {
    chunk_size: usize,
    /// When `Some`, every `new_object` call beyond this many outstanding
    /// objects is refused — used in tests to exercise the salvage path.
    max_outstanding: Option<usize>,
    outstanding: std::sync::atomic::AtomicUsize,
}

impl MemStorage {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            max_outstanding: None,
            outstanding: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_capacity_limit(chunk_size: usize, max_outstanding: usize) -> Self {
        Self {
            chunk_size,
            max_outstanding: Some(max_outstanding),
            outstanding: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl Storage for MemStorage {
    fn new_object(&self, _size_hint: u64) -> Option<Arc<StoredObject>> {
        if let Some(max) = self.max_outstanding {
            let prev = self
                .outstanding
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            if prev >= max {
                self.outstanding.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                return None;
            }
        }
        Some(Arc::new(StoredObject::default()))
    }

    fn alloc_chunk(&self, object: &StoredObject, remaining: u64) -> Option<Arc<Chunk>> {
        let cap = (self.chunk_size as u64).min(remaining.max(1)) as usize;
        let chunk = Arc::new(Chunk::new(cap));
        object.chunks.lock().push(chunk.clone());
        Some(chunk)
    }
}

/// The transient salvage allocator for short-lived objects (§6: `shortlived`
/// threshold). Functionally identical to `MemStorage` but never refuses —
/// it exists as a distinct type so call sites make the salvage decision
/// explicit rather than silently reusing the primary allocator.
pub struct TransientStorage {
    inner: MemStorage,
}

impl TransientStorage {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: MemStorage::new(chunk_size),
        }
    }
}

impl Storage for TransientStorage {
    fn new_object(&self, size_hint: u64) -> Option<Arc<StoredObject>> {
        self.inner.new_object(size_hint)
    }

    fn alloc_chunk(&self, object: &StoredObject, remaining: u64) -> Option<Arc<Chunk>> {
        self.inner.alloc_chunk(object, remaining)
    }
}

/// Writes `data` into `object` via `storage`, allocating chunks as needed.
/// Returns `FetchError::Storage` if the allocator refuses mid-write.
pub fn write_all(
    storage: &dyn Storage,
    object: &StoredObject,
    mut data: &[u8],
) -> Result<(), FetchError> {
    while !data.is_empty() {
        let chunk = storage
            .alloc_chunk(object, data.len() as u64)
            .ok_or_else(|| FetchError::Storage("could not get storage".to_string()))?;
        let take = data.len().min(chunk.buf.lock().capacity().max(1));
        let (head, rest) = data.split_at(take.min(data.len()));
        chunk.extend(head);
        chunk.seal();
        data = rest;
        if take == 0 {
            break;
        }
    }
    Ok(())
}
