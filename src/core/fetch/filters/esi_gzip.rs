// src/core/fetch/filters/esi_gzip.rs

//! Pushed when `do_esi` and `do_gzip` (or an already-gzipped body with
//! `do_esi` and no separate `do_gunzip`) both apply: ESI needs to scan
//! plain bytes to build the VEC program, but the object is stored
//! gzip-compressed either way. `decompress_input` tells the filter
//! whether it must inflate its input itself (the body arrives gzipped and
//! no `GunzipFilter` precedes it in the stack) or whether the bytes it
//! receives are already plain (a `GunzipFilter` was pushed ahead of it).
//! Its output is always gzip, matching its name.

use super::BodyFilter;
use crate::core::errors::FetchError;
use crate::core::esi::VepParser;
use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Write;

pub struct EsiGzipFilter {
    decoder: Option<GzDecoder<Vec<u8>>>,
    parser: Option<VepParser>,
    encoder: Option<GzEncoder<Vec<u8>>>,
    vec_program: Option<Vec<u8>>,
}

impl EsiGzipFilter {
    pub fn new(decompress_input: bool, max_carry_bytes: usize) -> Self {
        Self {
            decoder: decompress_input.then(|| GzDecoder::new(Vec::new())),
            parser: Some(VepParser::new(max_carry_bytes)),
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
            vec_program: None,
        }
    }

    fn plain_bytes(&mut self, input: &[u8]) -> Result<Vec<u8>, FetchError> {
        match self.decoder.as_mut() {
            Some(dec) => {
                dec.write_all(input)
                    .map_err(|e| FetchError::Filter(format!("esi_gzip: {e}")))?;
                Ok(std::mem::take(dec.get_mut()))
            }
            None => Ok(input.to_vec()),
        }
    }
}

impl BodyFilter for EsiGzipFilter {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError> {
        let plain = self.plain_bytes(input)?;
        self.parser
            .as_mut()
            .expect("push after finish")
            .feed(&plain)?;
        let enc = self.encoder.as_mut().expect("push after finish");
        enc.write_all(&plain)
            .map_err(|e| FetchError::Filter(format!("esi_gzip: {e}")))?;
        Ok(Bytes::from(std::mem::take(enc.get_mut())))
    }

    fn finish(&mut self) -> Result<Bytes, FetchError> {
        if let Some(dec) = self.decoder.take() {
            let tail = dec
                .finish()
                .map_err(|e| FetchError::Filter(format!("esi_gzip: {e}")))?;
            if !tail.is_empty() {
                self.parser
                    .as_mut()
                    .expect("push after finish")
                    .feed(&tail)?;
                self.encoder
                    .as_mut()
                    .expect("push after finish")
                    .write_all(&tail)
                    .map_err(|e| FetchError::Filter(format!("esi_gzip: {e}")))?;
            }
        }
        let parser = self.parser.take().expect("finished twice");
        self.vec_program = Some(parser.finish());
        let enc = self.encoder.take().expect("finished twice");
        let out = enc
            .finish()
            .map_err(|e| FetchError::Filter(format!("esi_gzip: {e}")))?;
        Ok(Bytes::from(out))
    }

    fn take_vec_program(&mut self) -> Option<Vec<u8>> {
        self.vec_program.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::gunzip::GunzipFilter;

    #[test]
    fn decompressing_variant_emits_gzip_and_vec_program() {
        let input = b"<esi:include src=\"/x\"/>plain";
        let mut gz = super::super::gzip::GzipFilter::new();
        let mut compressed = gz.push(input).unwrap().to_vec();
        compressed.extend_from_slice(&gz.finish().unwrap());

        let mut f = EsiGzipFilter::new(true, 1024);
        let mut out = f.push(&compressed).unwrap().to_vec();
        out.extend_from_slice(&f.finish().unwrap());
        assert_eq!(&out[0..2], &[0x1f, 0x8b]);

        let mut dec = GunzipFilter::new();
        let mut roundtrip = dec.push(&out).unwrap().to_vec();
        roundtrip.extend_from_slice(&dec.finish().unwrap());
        assert_eq!(roundtrip, input);

        assert!(f.take_vec_program().is_some());
    }

    #[test]
    fn non_decompressing_variant_treats_input_as_plain() {
        let mut f = EsiGzipFilter::new(false, 1024);
        let mut out = f.push(b"already plain").unwrap().to_vec();
        out.extend_from_slice(&f.finish().unwrap());
        assert_eq!(&out[0..2], &[0x1f, 0x8b]);
        assert!(f.take_vec_program().is_some());
    }
}
