// src/core/fetch/filters/esi_filter.rs

//! Pushed when `do_esi` is set and the body needs no gzip transcoding:
//! passes body bytes through to storage untouched while feeding them to
//! a `VepParser`, producing the VEC program that drives ESI assembly at
//! delivery time.

use super::BodyFilter;
use crate::core::errors::FetchError;
use crate::core::esi::VepParser;
use bytes::Bytes;

pub struct EsiFilter {
    parser: Option<VepParser>,
    vec_program: Option<Vec<u8>>,
}

impl EsiFilter {
    pub fn new(max_carry_bytes: usize) -> Self {
        Self {
            parser: Some(VepParser::new(max_carry_bytes)),
            vec_program: None,
        }
    }
}

impl BodyFilter for EsiFilter {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError> {
        self.parser
            .as_mut()
            .expect("push after finish")
            .feed(input)?;
        Ok(Bytes::copy_from_slice(input))
    }

    fn finish(&mut self) -> Result<Bytes, FetchError> {
        let parser = self.parser.take().expect("finished twice");
        self.vec_program = Some(parser.finish());
        Ok(Bytes::new())
    }

    fn take_vec_program(&mut self) -> Option<Vec<u8>> {
        self.vec_program.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_passes_through_untouched_and_vec_program_is_produced() {
        let mut f = EsiFilter::new(1024);
        let body = b"<html><esi:include src=\"/a\"/></html>";
        let mut out = f.push(body).unwrap().to_vec();
        out.extend_from_slice(&f.finish().unwrap());
        assert_eq!(out, body);
        let prog = f.take_vec_program().expect("vec program present");
        assert!(!prog.is_empty());
        assert!(f.take_vec_program().is_none(), "program is taken once");
    }
}
