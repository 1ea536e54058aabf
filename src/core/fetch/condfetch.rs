// src/core/fetch/condfetch.rs

//! Conditional refresh (C5): runs when FETCHHDR sees a 304 against an
//! `ims_obj` revalidation. The new object's headers come from the stale
//! object, not from the (bodyless) upstream response; only the storage
//! body is actually copied.

use crate::core::errors::FetchError;
use crate::core::exp::Exp;
use crate::core::objcore::{CacheObject, Objcore};
use crate::core::storage::{write_all, Storage};
use std::sync::Arc;
use std::time::SystemTime;

/// Builds a fresh `CacheObject` by copying the stale object's headers and
/// body, then re-arms the stale object's expiry so it retires once its
/// references drain. Bytes copied must equal the stale object's length;
/// any mismatch (the allocator running out mid-copy) is a `FetchError`.
/// `bo_exp` is the envelope already derived from the upstream's confirming
/// 304 in FETCHHDR — reused here rather than re-derived from the stale
/// object's own (pre-revalidation) headers, since a 304 can carry updated
/// `Cache-Control`/`Expires` values of its own.
pub fn run(
    stale: &mut CacheObject,
    new_objcore: Arc<Objcore>,
    storage: &dyn Storage,
    bo_exp: Exp,
    now: SystemTime,
) -> Result<CacheObject, FetchError> {
    let headers = stale.headers.duplicate();
    let stale_len = stale.len();

    let new_body = storage
        .new_object(stale_len)
        .ok_or_else(|| FetchError::Storage("no storage for condfetch object".to_string()))?;

    let mut copied = 0u64;
    for chunk in stale.body.chunks() {
        let data = chunk.snapshot();
        write_all(storage, &new_body, &data)?;
        copied += data.len() as u64;
        // Publish partial visibility after each copied segment, same as a
        // streaming FETCH extending its declared length as chunks arrive.
        new_body.set_declared_len(copied);
    }

    if copied != stale_len {
        return Err(FetchError::Storage(format!(
            "condfetch copied {copied} bytes, expected {stale_len}"
        )));
    }

    new_objcore.unbusy();

    let new_obj = CacheObject {
        objcore: new_objcore,
        headers,
        exp: bo_exp,
        body: new_body,
        is_gzip: stale.is_gzip,
        gzip_start: stale.gzip_start,
        gzip_last: stale.gzip_last,
        gzip_stop: stale.gzip_stop,
        vary: stale.vary.clone(),
        esi_vec_program: stale.esi_vec_program.clone(),
    };

    stale.rearm_retired(now);

    Ok(new_obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::http_block::HttpBlock;
    use crate::core::storage::MemStorage;
    use std::time::Duration;

    fn stale_object(storage: &MemStorage, body: &[u8]) -> CacheObject {
        let stored = storage.new_object(body.len() as u64).unwrap();
        write_all(storage, &stored, body).unwrap();
        stored.set_declared_len(body.len() as u64);

        let mut headers = HttpBlock::new();
        headers.set("Last-Modified", "Wed, 21 Oct 2020 07:28:00 GMT");
        headers.set("Content-Length", &body.len().to_string());

        CacheObject {
            objcore: Arc::new(Objcore::new()),
            headers,
            exp: Exp::zero(SystemTime::now()),
            body: stored,
            is_gzip: false,
            gzip_start: 0,
            gzip_last: 0,
            gzip_stop: 0,
            vary: None,
            esi_vec_program: None,
        }
    }

    #[test]
    fn copies_stale_body_and_rearms_stale_expiry() {
        let storage = MemStorage::new(4096);
        let mut stale = stale_object(&storage, b"abcd");
        let now = SystemTime::now();
        let bo_exp = Exp::zero(now);

        let fresh = run(&mut stale, Arc::new(Objcore::new()), &storage, bo_exp, now).unwrap();

        assert_eq!(fresh.len(), 4);
        assert_eq!(fresh.headers.get("Last-Modified"), Some("Wed, 21 Oct 2020 07:28:00 GMT"));
        assert!(!fresh.objcore.is_busy());
        assert!(!stale.exp.is_fresh(now));
    }

    #[test]
    fn reuses_the_confirming_304s_exp_instead_of_the_stale_headers() {
        // The 304's own Cache-Control (already derived into bo_exp by
        // FETCHHDR) wins over whatever the stale object's headers say.
        let storage = MemStorage::new(4096);
        let mut stale = stale_object(&storage, b"abcd");
        let now = SystemTime::now();
        let bo_exp = Exp {
            ttl: Duration::from_secs(99),
            grace: Duration::from_secs(5),
            keep: Duration::from_secs(5),
            t_origin: now,
        };

        let fresh = run(&mut stale, Arc::new(Objcore::new()), &storage, bo_exp, now).unwrap();

        assert_eq!(fresh.exp.ttl, Duration::from_secs(99));
    }

    #[test]
    fn storage_refusal_surfaces_as_fetch_error() {
        let storage = MemStorage::with_capacity_limit(4096, 0);
        let ok_storage = MemStorage::new(4096);
        let mut stale = stale_object(&ok_storage, b"abcd");
        let now = SystemTime::now();
        let err = run(&mut stale, Arc::new(Objcore::new()), &storage, Exp::zero(now), now);
        assert!(err.is_err());
    }
}
