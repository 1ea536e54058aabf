// src/core/fetch/filters/gzip.rs

//! Pushed when `do_gzip` is set and the body isn't already gzip-encoded:
//! compresses the backend's plain body before it lands in storage.

use super::BodyFilter;
use crate::core::errors::FetchError;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

pub struct GzipFilter {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipFilter {
    pub fn new() -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl Default for GzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyFilter for GzipFilter {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError> {
        let enc = self.encoder.as_mut().expect("push after finish");
        enc.write_all(input)
            .map_err(|e| FetchError::Filter(format!("gzip: {e}")))?;
        Ok(Bytes::from(std::mem::take(enc.get_mut())))
    }

    fn finish(&mut self) -> Result<Bytes, FetchError> {
        let enc = self.encoder.take().expect("finished twice");
        let out = enc
            .finish()
            .map_err(|e| FetchError::Filter(format!("gzip: {e}")))?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_output_starts_with_gzip_magic() {
        let mut f = GzipFilter::new();
        let mut out = f.push(b"hello world").unwrap().to_vec();
        out.extend_from_slice(&f.finish().unwrap());
        assert_eq!(&out[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn finish_is_one_shot() {
        let mut f = GzipFilter::new();
        f.finish().unwrap();
        f.finish().unwrap();
    }
}
