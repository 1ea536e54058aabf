// src/core/fetch/state_machine.rs

//! The VBF fetch state machine (C6): MKBEREQ → STARTFETCH → FETCHHDR →
//! {FETCH | CONDFETCH | RETRY | ERROR} → DONE. One `run` call owns a
//! `BusyObj` for the lifetime of the attempt; every transition is logged
//! via `tracing` under the BO's `txid` in place of a VSL log boundary.

use super::condfetch;
use super::filters::esi_filter::EsiFilter;
use super::filters::esi_gzip::EsiGzipFilter;
use super::filters::gunzip::GunzipFilter;
use super::filters::gzip::GzipFilter;
use super::filters::test_gunzip::TestGunzipFilter;
use super::filters::{finish_chain, push_chunk, take_vec_program, BodyFilter};
use crate::config::FetchConfig;
use crate::core::busyobj::{BodyStatus, BoFlags, BoState, BusyObj};
use crate::core::connection::{BackendConnection, FetchHdrOutcome};
use crate::core::errors::FetchError;
use crate::core::exp::Exp;
use crate::core::hash_index::{CacheKey, HashIndex};
use crate::core::http_block::HttpBlock;
use crate::core::metrics;
use crate::core::objcore::{CacheObject, Objcore};
use crate::core::storage::{write_all, Storage, StoredObject};
use crate::core::vcl::{BackendFetchVerdict, BackendResponseVerdict, VclHooks};
use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;

/// The collaborators a fetch attempt needs, gathered so `run` doesn't take
/// a dozen positional arguments. Borrowed for the duration of one fetch.
pub struct FetchContext<'a> {
    pub hash_index: &'a dyn HashIndex,
    pub storage: &'a dyn Storage,
    pub transient_storage: &'a dyn Storage,
    pub connection: &'a dyn BackendConnection,
    pub vcl: &'a dyn VclHooks,
    pub config: &'a FetchConfig,
    /// Bound on the ESI parser's match-table carry buffer (`esi.max_carry_bytes`).
    pub esi_max_carry_bytes: usize,
    pub key: CacheKey,
    pub url: String,
}

/// What a fetch attempt settled on. `object` is populated for FETCH,
/// CONDFETCH, and ERROR (the synthesized 503); it is `None` only for
/// `FetchError::Abandoned`, which never synthesizes a response.
pub struct FetchOutcome {
    pub state: BoState,
    pub object: Option<CacheObject>,
    pub error: Option<FetchError>,
}

enum Step {
    MkBereq,
    StartFetch,
    FetchHdr,
    Retry,
    Fetch { beresp: HttpBlock, body: Bytes },
    CondFetch,
    Error(FetchError),
    Done(FetchOutcome),
}

/// Runs one fetch attempt (including any internal RETRY cycles) to
/// completion. `stale` is the IMS object being revalidated, if any.
pub async fn run(bo: Arc<BusyObj>, ctx: &FetchContext<'_>, mut stale: Option<CacheObject>) -> FetchOutcome {
    let mut step = Step::MkBereq;
    loop {
        step = match step {
            Step::MkBereq => mkbereq(&bo, stale.as_ref(), ctx.config.http_gzip_support),
            Step::StartFetch => start_fetch(&bo, ctx).await,
            Step::FetchHdr => fetch_hdr(&bo, ctx, stale.as_ref()).await,
            Step::Retry => retry(&bo),
            Step::Fetch { beresp, body } => fetch(&bo, ctx, beresp, body).await,
            Step::CondFetch => cond_fetch(&bo, ctx, stale.as_mut()),
            Step::Error(e) => error(&bo, ctx, e).await,
            Step::Done(outcome) => return outcome,
        };
    }
}

fn mkbereq(bo: &BusyObj, stale: Option<&CacheObject>, http_gzip_support: bool) -> Step {
    bo.with_work(|w| {
        w.has_ims_obj = stale.is_some();
        if !w.flags.do_pass {
            w.bereq.method = Some("GET".to_string());
        }
        if http_gzip_support {
            w.bereq.set("Accept-Encoding", "gzip");
        }
        w.bereq0 = w.bereq.duplicate();

        if let Some(stale) = stale {
            if let Some(lm) = stale.headers.get("Last-Modified") {
                w.bereq.set("If-Modified-Since", lm);
            } else if let Some(etag) = stale.headers.get("ETag") {
                w.bereq.set("If-None-Match", etag);
            } else {
                w.has_ims_obj = false;
            }
        }
    });
    Step::StartFetch
}

async fn start_fetch(bo: &BusyObj, ctx: &FetchContext<'_>) -> Step {
    bo.with_work(|w| {
        w.bereq = w.bereq0.duplicate();
    });

    match ctx.vcl.backend_fetch(bo).await {
        BackendFetchVerdict::Fetch => {
            let txid = bo.txid();
            bo.with_work(|w| w.bereq.set("X-Varnish", txid.to_string()));
            Step::FetchHdr
        }
        BackendFetchVerdict::Abandon => {
            metrics::FETCH_ABANDONED_TOTAL.inc();
            ctx.hash_index.fail(&ctx.key);
            bo.set_state(BoState::Failed);
            Step::Done(FetchOutcome {
                state: BoState::Failed,
                object: None,
                error: Some(FetchError::Abandoned),
            })
        }
    }
}

async fn fetch_hdr(bo: &BusyObj, ctx: &FetchContext<'_>, stale: Option<&CacheObject>) -> Step {
    let bereq = bo.snapshot().bereq;
    let mut reused = true;
    let mut recycle_retried = false;

    loop {
        match ctx.connection.fetch_hdr(&bereq, &ctx.url, reused).await {
            FetchHdrOutcome::Ok(mut beresp, reader) => {
                let body_status = determine_body_status(&beresp);
                if matches!(body_status, BodyStatus::Error) {
                    ctx.connection.close();
                    return Step::Error(FetchError::BodyStatus(
                        "conflicting Content-Length/Transfer-Encoding".to_string(),
                    ));
                }

                let has_ims_obj = bo.snapshot().has_ims_obj;
                let is_304 = has_ims_obj && beresp.status == Some(304);
                if is_304 {
                    beresp.status = Some(200);
                    if let Some(stale) = stale {
                        beresp.set("Content-Length", stale.len().to_string());
                    }
                    bo.with_work(|w| w.flags.do_ims = true);
                }

                let exp = Exp::derive(&beresp, SystemTime::now());
                // An EOF-framed body has no length of its own; the only way
                // to know it ended was the connection closing, so it can't
                // be handed back to the pool for reuse.
                let should_close = matches!(body_status, BodyStatus::Eof);
                bo.with_work(|w| {
                    w.beresp = beresp.clone();
                    w.exp = exp;
                    w.body_status = body_status;
                    w.flags.should_close = should_close;
                });

                match ctx.vcl.backend_response(bo).await {
                    BackendResponseVerdict::Deliver => {
                        bo.set_state(BoState::Committed);
                        if is_304 {
                            return Step::CondFetch;
                        }
                        let body = match reader.read_all().await {
                            Ok(b) => b,
                            Err(e) => return Step::Error(e),
                        };
                        return Step::Fetch { beresp, body };
                    }
                    BackendResponseVerdict::Retry => {
                        let retries = bo.snapshot().retries;
                        if retries < ctx.config.max_retries {
                            bo.with_work(|w| w.retries += 1);
                            metrics::POLICY_RETRY_TOTAL.with_label_values(&["retry"]).inc();
                            ctx.connection.close();
                            return Step::Retry;
                        }
                        metrics::POLICY_RETRY_TOTAL.with_label_values(&["exhausted"]).inc();
                        return Step::Error(FetchError::RetriesExhausted);
                    }
                }
            }
            FetchHdrOutcome::RecycleLost => {
                if recycle_retried {
                    return Step::Error(FetchError::Backend(
                        "recycled connection lost twice".to_string(),
                    ));
                }
                recycle_retried = true;
                metrics::BACKEND_RETRY_TOTAL.inc();
                reused = false;
                continue;
            }
            FetchHdrOutcome::Fatal(e) => return Step::Error(e),
        }
    }
}

fn retry(bo: &BusyObj) -> Step {
    let old_txid = bo.txid();
    let new_txid = old_txid + 1;
    bo.with_work(|w| w.txid = new_txid);
    tracing::info!(retry_of = old_txid, txid = new_txid, "retry");
    Step::StartFetch
}

async fn fetch(bo: &BusyObj, ctx: &FetchContext<'_>, mut beresp: HttpBlock, body: Bytes) -> Step {
    let flags = bo.snapshot().flags;
    let is_gzip = beresp
        .get("Content-Encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let flags = BoFlags { is_gzip, ..flags };
    bo.with_work(|w| w.flags = flags);

    let vary = match validate_vary(&beresp) {
        Ok(vary) => vary,
        Err(e) => {
            tracing::warn!(error = %e, "illegal vary from backend, coercing to pass");
            bo.with_work(|w| {
                w.flags.uncacheable = true;
                w.flags.do_pass = true;
            });
            None
        }
    };

    let (mut stack, weaken, result_is_gzip) = compose_filters(&flags, ctx.esi_max_carry_bytes);
    if weaken {
        weaken_etag(&mut beresp);
    }

    let size_hint = beresp
        .get("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let (object, storage_used): (Arc<StoredObject>, &dyn Storage) = match ctx.storage.new_object(size_hint) {
        Some(obj) => (obj, ctx.storage),
        None => {
            // Transient salvage is only for objects whose freshness window
            // is already below the shortlived threshold; an object that
            // would still be fresh past that point is refused outright
            // rather than quietly downgraded to a short-lived copy.
            let ttl = bo.snapshot().exp.ttl;
            if ttl >= ctx.config.shortlived {
                return Step::Error(FetchError::Storage("no storage available".to_string()));
            }
            match ctx.transient_storage.new_object(size_hint) {
                Some(obj) => {
                    metrics::STORAGE_SALVAGE_TOTAL.inc();
                    bo.with_work(|w| w.exp = w.exp.clamped_for_salvage(ctx.config.shortlived));
                    (obj, ctx.transient_storage)
                }
                None => return Step::Error(FetchError::Storage("no storage available".to_string())),
            }
        }
    };

    bo.set_state(BoState::Fetching);
    if flags.do_stream {
        ctx.hash_index.unbusy(&ctx.key);
    }

    let filtered = match push_chunk(&mut stack, &body) {
        Ok(chunk) => chunk,
        Err(e) => {
            ctx.connection.close();
            return Step::Error(e);
        }
    };
    let tail = match finish_chain(&mut stack) {
        Ok(tail) => tail,
        Err(e) => {
            ctx.connection.close();
            return Step::Error(e);
        }
    };

    if let Err(e) = write_all(storage_used, &object, &filtered) {
        return Step::Error(e);
    }
    if let Err(e) = write_all(storage_used, &object, &tail) {
        return Step::Error(e);
    }
    object.set_declared_len(filtered.len() as u64 + tail.len() as u64);

    let esi_vec_program = take_vec_program(&mut stack);

    bo.set_state(BoState::Finished);
    ctx.hash_index.complete(&ctx.key);
    metrics::FETCH_COMPLETED_TOTAL.inc();

    let exp = bo.snapshot().exp;
    Step::Done(FetchOutcome {
        state: BoState::Finished,
        object: Some(CacheObject {
            objcore: bo.fetch_objcore.clone(),
            headers: beresp,
            exp,
            body: object,
            is_gzip: result_is_gzip,
            gzip_start: 0,
            gzip_last: 0,
            gzip_stop: if result_is_gzip {
                filtered.len() as u64 + tail.len() as u64
            } else {
                0
            },
            vary,
            esi_vec_program,
        }),
        error: None,
    })
}

fn cond_fetch(bo: &BusyObj, ctx: &FetchContext<'_>, stale: Option<&mut CacheObject>) -> Step {
    let stale = match stale {
        Some(s) => s,
        None => {
            return Step::Error(FetchError::BodyStatus(
                "304 received without an ims_obj to revalidate".to_string(),
            ))
        }
    };

    let bo_exp = bo.snapshot().exp;
    match condfetch::run(stale, bo.fetch_objcore.clone(), ctx.storage, bo_exp, SystemTime::now()) {
        Ok(fresh) => {
            bo.set_state(BoState::Finished);
            ctx.hash_index.complete(&ctx.key);
            metrics::FETCH_CONDFETCH_TOTAL.inc();
            Step::Done(FetchOutcome {
                state: BoState::Finished,
                object: Some(fresh),
                error: None,
            })
        }
        Err(e) => Step::Error(e),
    }
}

async fn error(bo: &BusyObj, ctx: &FetchContext<'_>, e: FetchError) -> Step {
    let now = SystemTime::now();
    let mut synthetic = HttpBlock::new();
    synthetic.status = Some(503);
    synthetic.set("Content-Type", "text/plain");
    bo.with_work(|w| w.beresp = synthetic.clone());

    ctx.vcl.backend_error(bo).await;
    let beresp = bo.snapshot().beresp;

    ctx.hash_index.fail(&ctx.key);
    bo.set_state(BoState::Failed);
    metrics::FETCH_ERROR_TOTAL.inc();
    tracing::warn!(error = %e, "backend fetch failed, delivering synthetic 503");

    let object = if e.synthesizes_503() {
        ctx.storage.new_object(0).or_else(|| ctx.transient_storage.new_object(0)).map(|body| {
            CacheObject {
                objcore: bo.fetch_objcore.clone(),
                headers: beresp,
                exp: Exp::zero(now),
                body,
                is_gzip: false,
                gzip_start: 0,
                gzip_last: 0,
                gzip_stop: 0,
                vary: None,
                esi_vec_program: None,
            }
        })
    } else {
        None
    };

    Step::Done(FetchOutcome {
        state: BoState::Failed,
        object,
        error: Some(e),
    })
}

fn determine_body_status(beresp: &HttpBlock) -> BodyStatus {
    let content_length = beresp.get("Content-Length");
    let chunked = beresp
        .get("Transfer-Encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    match (content_length, chunked) {
        (Some(_), true) => BodyStatus::Error,
        (Some(len), false) => len
            .parse::<u64>()
            .map(BodyStatus::Length)
            .unwrap_or(BodyStatus::Error),
        (None, true) => BodyStatus::Chunked,
        (None, false) => BodyStatus::Eof,
    }
}

fn validate_vary(beresp: &HttpBlock) -> Result<Option<Bytes>, FetchError> {
    match beresp.get("Vary") {
        None => Ok(None),
        Some(v) if v.trim() == "*" => Err(FetchError::IllegalVary(
            "Vary: * can never be matched by a future request".to_string(),
        )),
        Some(v) => Ok(Some(Bytes::copy_from_slice(v.as_bytes()))),
    }
}

fn weaken_etag(headers: &mut HttpBlock) {
    if let Some(etag) = headers.get("ETag").map(|s| s.to_string()) {
        if !etag.starts_with("W/") {
            headers.set("ETag", format!("W/{etag}"));
        }
    }
}

/// Filter-stack composition (§4.1): evaluated in source order, each clause
/// adds a filter if its predicate holds. Returns the stack, whether the
/// object's ETag must be weakened, and the resulting on-disk encoding.
fn compose_filters(flags: &BoFlags, esi_max_carry_bytes: usize) -> (Vec<Box<dyn BodyFilter>>, bool, bool) {
    let mut stack: Vec<Box<dyn BodyFilter>> = Vec::new();
    let mut weaken = false;
    let mut result_is_gzip = flags.is_gzip;

    let gunzip_pushed = flags.do_gunzip || (flags.is_gzip && flags.do_esi);
    if gunzip_pushed {
        stack.push(Box::new(GunzipFilter::new()));
        weaken = true;
        result_is_gzip = false;
    }

    let decompress_in_esi_gzip = flags.is_gzip && !gunzip_pushed;
    if flags.do_esi && flags.do_gzip {
        stack.push(Box::new(EsiGzipFilter::new(decompress_in_esi_gzip, esi_max_carry_bytes)));
        weaken = true;
        result_is_gzip = true;
    } else if flags.do_esi && flags.is_gzip && !flags.do_gunzip {
        stack.push(Box::new(EsiGzipFilter::new(decompress_in_esi_gzip, esi_max_carry_bytes)));
        weaken = true;
        result_is_gzip = true;
    } else if flags.do_esi {
        stack.push(Box::new(EsiFilter::new(esi_max_carry_bytes)));
    } else if flags.do_gzip {
        stack.push(Box::new(GzipFilter::new()));
        weaken = true;
        result_is_gzip = true;
    } else if flags.is_gzip && !flags.do_gunzip {
        stack.push(Box::new(TestGunzipFilter::new()));
    }

    (stack, weaken, result_is_gzip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::BodyReader;
    use crate::core::hash_index::MemHashIndex;
    use crate::core::storage::MemStorage;
    use crate::core::vcl::{ClosureVclHooks, NoopVclHooks};
    use async_trait::async_trait;
    use bytes::Bytes as BytesAlias;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// `BodyReader` wraps a live `reqwest::Response`, so a fully scripted
    /// connection can't return `FetchHdrOutcome::Ok` without a real HTTP
    /// round trip. Tests that need the post-header body exercise `fetch()`
    /// directly instead; this stand-in only ever returns `Fatal`/`RecycleLost`.
    struct UnreachableConnection;

    #[async_trait]
    impl BackendConnection for UnreachableConnection {
        async fn fetch_hdr(&self, _bereq: &HttpBlock, _url: &str, _reused: bool) -> FetchHdrOutcome {
            unreachable!("this test never reaches the network")
        }
    }

    /// One scripted step for a connection driven through a fixed call
    /// sequence. `Ok200` builds a fresh `HttpBlock`/`BodyReader` pair per
    /// call from its `body`, since neither is `Clone`.
    enum Script {
        Ok200 { body: Bytes },
        RecycleLost,
        Fatal(String),
    }

    /// Drives `fetch_hdr` through a fixed sequence of outcomes, one per
    /// call; panics if called more times than the script provides for.
    struct ScriptedConnection {
        calls: AtomicUsize,
        script: Vec<Script>,
    }

    impl ScriptedConnection {
        fn new(script: Vec<Script>) -> Self {
            ScriptedConnection {
                calls: AtomicUsize::new(0),
                script,
            }
        }
    }

    #[async_trait]
    impl BackendConnection for ScriptedConnection {
        async fn fetch_hdr(&self, _bereq: &HttpBlock, _url: &str, _reused: bool) -> FetchHdrOutcome {
            let i = self.calls.fetch_add(1, Ordering::AcqRel);
            match self.script.get(i).expect("script exhausted") {
                Script::Ok200 { body } => {
                    let mut beresp = HttpBlock::new();
                    beresp.status = Some(200);
                    beresp.append("Content-Length", body.len().to_string());
                    FetchHdrOutcome::Ok(beresp, BodyReader::from_bytes(body.clone()))
                }
                Script::RecycleLost => FetchHdrOutcome::RecycleLost,
                Script::Fatal(msg) => FetchHdrOutcome::Fatal(FetchError::Backend(msg.clone())),
            }
        }
    }

    fn context<'a>(
        hash_index: &'a MemHashIndex,
        storage: &'a MemStorage,
        transient: &'a MemStorage,
        connection: &'a dyn BackendConnection,
        vcl: &'a dyn VclHooks,
        config: &'a FetchConfig,
    ) -> FetchContext<'a> {
        FetchContext {
            hash_index,
            storage,
            transient_storage: transient,
            connection,
            vcl,
            config,
            esi_max_carry_bytes: 1024,
            key: BytesAlias::from_static(b"k"),
            url: "http://example.com/".to_string(),
        }
    }

    fn test_config() -> FetchConfig {
        FetchConfig {
            http_gzip_support: true,
            shortlived: std::time::Duration::from_secs(10),
            max_retries: 2,
            fetch_chunksize_bytes: 4096,
        }
    }

    fn make_bo() -> Arc<BusyObj> {
        BusyObj::new(1, HttpBlock::new(), Arc::new(Objcore::new()))
    }

    #[tokio::test]
    async fn fetch_runs_filters_and_completes() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let noop = NoopVclHooks;
        let conn = UnreachableConnection;
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &noop, &config);
        hash_index.ref_or_join(ctx.key.clone(), bo.clone());

        let mut beresp = HttpBlock::new();
        beresp.status = Some(200);
        beresp.append("Content-Length", "5");

        let step = fetch(&bo, &ctx, beresp, Bytes::from_static(b"hello")).await;
        match step {
            Step::Done(outcome) => {
                assert_eq!(outcome.state, BoState::Finished);
                let obj = outcome.object.expect("object present");
                assert_eq!(obj.len(), 5);
                assert!(!obj.objcore.is_busy());
            }
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn abandon_policy_fails_without_synthesizing() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let hooks = ClosureVclHooks {
            on_backend_fetch: |_: &BusyObj| BackendFetchVerdict::Abandon,
            on_backend_response: |_: &BusyObj| BackendResponseVerdict::Deliver,
        };
        let conn = UnreachableConnection;
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &hooks, &config);
        hash_index.ref_or_join(ctx.key.clone(), bo.clone());

        let outcome = run(bo.clone(), &ctx, None).await;
        assert_eq!(outcome.state, BoState::Failed);
        assert!(outcome.object.is_none());
        assert!(matches!(outcome.error, Some(FetchError::Abandoned)));
        assert!(bo.fetch_objcore.is_failed());
    }

    #[tokio::test]
    async fn recycle_lost_retries_once_then_succeeds() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let noop = NoopVclHooks;
        let conn = ScriptedConnection::new(vec![
            Script::RecycleLost,
            Script::Ok200 {
                body: Bytes::from_static(b"hello"),
            },
        ]);
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &noop, &config);

        let before = metrics::BACKEND_RETRY_TOTAL.get();
        let step = fetch_hdr(&bo, &ctx, None).await;
        let after = metrics::BACKEND_RETRY_TOTAL.get();
        assert_eq!(after, before + 1.0);
        match step {
            Step::Fetch { body, .. } => assert_eq!(&body[..], b"hello"),
            _ => panic!("expected the retried call to succeed"),
        }
    }

    #[tokio::test]
    async fn recycle_lost_twice_is_fatal() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let noop = NoopVclHooks;
        let conn = ScriptedConnection::new(vec![Script::RecycleLost, Script::RecycleLost]);
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &noop, &config);

        let step = fetch_hdr(&bo, &ctx, None).await;
        assert!(matches!(step, Step::Error(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_synthesizes_503() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let noop = NoopVclHooks;
        let conn = ScriptedConnection::new(vec![Script::Fatal("connection refused".to_string())]);
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &noop, &config);
        hash_index.ref_or_join(ctx.key.clone(), bo.clone());

        let outcome = run(bo.clone(), &ctx, None).await;
        assert_eq!(outcome.state, BoState::Failed);
        let obj = outcome.object.expect("503 is synthesized");
        assert_eq!(obj.headers.status, Some(503));
        assert!(bo.fetch_objcore.is_failed());
    }

    /// S1 from the testable-properties scenarios: a normal cacheable miss
    /// with no transcoding runs MKBEREQ -> STARTFETCH -> FETCHHDR -> FETCH
    /// -> DONE and produces a 5-byte, non-busy, complete object.
    #[tokio::test]
    async fn full_run_completes_a_normal_miss() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let noop = NoopVclHooks;
        let conn = ScriptedConnection::new(vec![Script::Ok200 {
            body: Bytes::from_static(b"hello"),
        }]);
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &noop, &config);
        hash_index.ref_or_join(ctx.key.clone(), bo.clone());

        let outcome = run(bo.clone(), &ctx, None).await;
        assert_eq!(outcome.state, BoState::Finished);
        let obj = outcome.object.expect("object present");
        assert_eq!(obj.len(), 5);
        assert!(!obj.objcore.is_busy());
        assert!(!bo.fetch_objcore.is_failed());
    }

    /// S4: VCL returns RETRY on every attempt; once `retries` hits
    /// `max_retries` the state machine gives up with `RetriesExhausted`
    /// instead of cycling forever.
    #[tokio::test]
    async fn retry_policy_exhausts_and_fails() {
        let bo = make_bo();
        let hash_index = MemHashIndex::new();
        let storage = MemStorage::new(4096);
        let transient = MemStorage::new(4096);
        let hooks = ClosureVclHooks {
            on_backend_fetch: |_: &BusyObj| BackendFetchVerdict::Fetch,
            on_backend_response: |_: &BusyObj| BackendResponseVerdict::Retry,
        };
        // max_retries=2 means three attempts total: two RETRY cycles, then exhaustion.
        let conn = ScriptedConnection::new(vec![
            Script::Ok200 {
                body: Bytes::from_static(b"x"),
            },
            Script::Ok200 {
                body: Bytes::from_static(b"x"),
            },
            Script::Ok200 {
                body: Bytes::from_static(b"x"),
            },
        ]);
        let config = test_config();
        let ctx = context(&hash_index, &storage, &transient, &conn, &hooks, &config);
        hash_index.ref_or_join(ctx.key.clone(), bo.clone());

        let outcome = run(bo.clone(), &ctx, None).await;
        assert_eq!(outcome.state, BoState::Failed);
        assert!(matches!(outcome.error, Some(FetchError::RetriesExhausted)));
        assert_eq!(bo.snapshot().retries, config.max_retries);
        assert!(bo.fetch_objcore.is_failed());
    }

    #[test]
    fn compose_filters_picks_esi_gzip_when_both_requested() {
        let flags = BoFlags {
            do_esi: true,
            do_gzip: true,
            ..Default::default()
        };
        let (stack, weaken, is_gzip) = compose_filters(&flags, 1024);
        assert_eq!(stack.len(), 1);
        assert!(weaken);
        assert!(is_gzip);
    }

    #[test]
    fn compose_filters_picks_gunzip_and_esi_when_input_is_already_gzip() {
        let flags = BoFlags {
            do_esi: true,
            is_gzip: true,
            ..Default::default()
        };
        let (stack, weaken, is_gzip) = compose_filters(&flags, 1024);
        // Clause 1 fires (is_gzip && do_esi), clause 4 then fires for plain esi.
        assert_eq!(stack.len(), 2);
        assert!(weaken);
        assert!(!is_gzip);
    }

    #[test]
    fn compose_filters_picks_test_gunzip_for_untouched_gzip_passthrough() {
        let flags = BoFlags {
            is_gzip: true,
            ..Default::default()
        };
        let (stack, weaken, is_gzip) = compose_filters(&flags, 1024);
        assert_eq!(stack.len(), 1);
        assert!(!weaken);
        assert!(is_gzip);
    }
}
