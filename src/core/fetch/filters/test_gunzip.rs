// src/core/fetch/filters/test_gunzip.rs

//! Pushed when the body is already gzip-encoded and neither `do_gunzip`
//! nor ESI processing needs the plain bytes: verifies the compressed
//! stream is well-formed without transcoding it, so a corrupt upstream
//! body is caught at fetch time instead of being cached and only
//! discovered when a client tries to decode it.

use super::BodyFilter;
use crate::core::errors::FetchError;
use bytes::Bytes;
use flate2::write::GzDecoder;
use std::io::{sink, Sink, Write};

pub struct TestGunzipFilter {
    decoder: Option<GzDecoder<Sink>>,
}

impl TestGunzipFilter {
    pub fn new() -> Self {
        Self {
            decoder: Some(GzDecoder::new(sink())),
        }
    }
}

impl Default for TestGunzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyFilter for TestGunzipFilter {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError> {
        let dec = self.decoder.as_mut().expect("push after finish");
        dec.write_all(input)
            .map_err(|e| FetchError::Filter(format!("gzip integrity check failed: {e}")))?;
        // Integrity-only: storage gets the original bytes, unchanged.
        Ok(Bytes::copy_from_slice(input))
    }

    fn finish(&mut self) -> Result<Bytes, FetchError> {
        let dec = self.decoder.take().expect("finished twice");
        dec.finish().map_err(|e| {
            FetchError::Filter(format!("gzip integrity check failed at eof: {e}"))
        })?;
        Ok(Bytes::new())
    }
}
