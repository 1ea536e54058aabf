// src/core/fetch/filters/mod.rs

//! The VFP filter chain: a pull-based stack of `BodyFilter`s the fetch
//! state machine threads each chunk of backend body through before it
//! reaches storage. Composition order is decided by `state_machine.rs`
//! from the BO's flags per spec.md §4.1's predicate table; each filter
//! here only knows how to transform its own input, not why it was chosen.

pub mod esi_filter;
pub mod esi_gzip;
pub mod gunzip;
pub mod gzip;
pub mod test_gunzip;

use crate::core::errors::FetchError;
use bytes::Bytes;

/// One stage of the filter chain. `push` is called once per chunk read
/// from the backend connection, in order; `finish` is called exactly once
/// after the last chunk, to flush whatever the filter buffered internally
/// (a `GzEncoder`'s trailer, a parser's final verbatim run).
pub trait BodyFilter: Send {
    fn push(&mut self, input: &[u8]) -> Result<Bytes, FetchError>;

    fn finish(&mut self) -> Result<Bytes, FetchError>;

    /// ESI-aware filters compile a VEC program alongside passing body
    /// bytes through unchanged; this surfaces it once `finish` has run.
    /// Every other filter keeps the default of `None`.
    fn take_vec_program(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Runs a chunk through every filter in the stack, in order, concatenating
/// each filter's output before it becomes the next filter's input.
pub fn push_chunk(stack: &mut [Box<dyn BodyFilter>], input: &[u8]) -> Result<Bytes, FetchError> {
    let mut buf = Bytes::copy_from_slice(input);
    for filter in stack.iter_mut() {
        buf = filter.push(&buf)?;
    }
    Ok(buf)
}

/// Flushes every filter in the stack, in source order. A filter's trailing
/// bytes (e.g. a `GunzipFilter`'s last decompressed fragment) are not yet
/// processed by anything downstream, so they are pushed through the rest
/// of the stack before that stage's own output is counted — otherwise a
/// two-filter stack (gunzip, then esi) would hand ESI's compiler bytes it
/// never saw.
pub fn finish_chain(stack: &mut [Box<dyn BodyFilter>]) -> Result<Bytes, FetchError> {
    let mut out = Vec::new();
    for i in 0..stack.len() {
        let mut tail = stack[i].finish()?;
        for downstream in stack[i + 1..].iter_mut() {
            tail = downstream.push(&tail)?;
        }
        out.extend_from_slice(&tail);
    }
    Ok(Bytes::from(out))
}

/// Collects the VEC program from whichever filter in the stack produced
/// one, if any. At most one filter in a composed stack is ever ESI-aware.
pub fn take_vec_program(stack: &mut [Box<dyn BodyFilter>]) -> Option<Vec<u8>> {
    stack.iter_mut().find_map(|f| f.take_vec_program())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::gzip::GzipFilter;

    #[test]
    fn push_chunk_runs_through_single_filter() {
        let mut stack: Vec<Box<dyn BodyFilter>> = vec![Box::new(GzipFilter::new())];
        let out = push_chunk(&mut stack, b"hello").unwrap();
        // gzip buffers internally; a single small write need not emit
        // anything until finish.
        let _ = out;
        let tail = finish_chain(&mut stack).unwrap();
        assert!(!tail.is_empty());
        assert_eq!(&tail[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn empty_stack_passes_bytes_through() {
        let mut stack: Vec<Box<dyn BodyFilter>> = vec![];
        let out = push_chunk(&mut stack, b"abc").unwrap();
        assert_eq!(&out[..], b"abc");
    }
}
