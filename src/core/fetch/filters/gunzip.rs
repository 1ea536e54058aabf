// src/core/fetch/filters/gunzip.rs

//! Pushed when `do_gunzip` is set: decompresses an upstream gzip body
//! before storage, so it can be served uncompressed to clients that
//! didn't ask for `Content-Encoding: gzip`.

use super::BodyFilter;
use crate::core::errors::FetchError;
use bytes::Bytes;
use flate2::write::GzDecoder;
use std::io::Write;

pub struct GunzipFilter {
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GunzipFilter {
    pub fn new() -> Self {
        Self {
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Default for GunzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyFilter for GunzipFilter {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError> {
        let dec = self.decoder.as_mut().expect("push after finish");
        dec.write_all(input)
            .map_err(|e| FetchError::Filter(format!("gunzip: {e}")))?;
        Ok(Bytes::from(std::mem::take(dec.get_mut())))
    }

    fn finish(&mut self) -> Result<Bytes, FetchError> {
        let dec = self.decoder.take().expect("finished twice");
        let out = dec
            .finish()
            .map_err(|e| FetchError::Filter(format!("gunzip: truncated or corrupt stream: {e}")))?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::gzip::GzipFilter;

    #[test]
    fn round_trips_through_gzip() {
        let mut enc = GzipFilter::new();
        let mut compressed = enc.push(b"round trip me").unwrap().to_vec();
        compressed.extend_from_slice(&enc.finish().unwrap());

        let mut dec = GunzipFilter::new();
        let mut plain = dec.push(&compressed).unwrap().to_vec();
        plain.extend_from_slice(&dec.finish().unwrap());
        assert_eq!(plain, b"round trip me");
    }

    #[test]
    fn corrupt_stream_is_a_filter_error() {
        let mut dec = GunzipFilter::new();
        let _ = dec.push(b"not gzip at all");
        assert!(dec.finish().is_err());
    }
}
