// src/core/esi/match_table.rs

//! C2: longest-prefix match of a small, ordered keyword table against a
//! streaming input, buffering continuation across fragment boundaries.
//!
//! Matching is driven one byte at a time so that the parser built on top of
//! it is naturally fragmentation-invariant: behavior depends only on the
//! accumulated carry buffer, never on how the caller chose to chunk input.

use crate::core::errors::FetchError;

/// One entry in an ordered match table.
pub struct MatchEntry<T: Copy + 'static> {
    pub needle: &'static [u8],
    pub target: T,
}

/// An ordered table terminated conceptually by a fallback target.
pub struct MatchTable<T: Copy + 'static> {
    pub entries: &'static [MatchEntry<T>],
    pub fallback: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult<T> {
    /// A needle was fully consumed; the carry buffer has been cleared.
    Hit(T),
    /// No entry can ever match the accumulated carry; the carry buffer has
    /// been cleared. The caller is responsible for reprocessing/accounting
    /// for the bytes that were in the carry, per its own semantics.
    Fallback(T),
    /// At least one entry is still a live prefix candidate; more input is needed.
    Indeterminate,
}

impl<T: Copy + 'static> MatchTable<T> {
    /// Maximum carry length this table can ever need.
    pub fn max_needle_len(&self) -> usize {
        self.entries.iter().map(|e| e.needle.len()).max().unwrap_or(0)
    }

    /// Feeds one byte into the match. `carry` must be the same buffer across
    /// repeated calls until a `Hit`/`Fallback` is returned, at which point it
    /// is cleared automatically and ready for reuse against a new table.
    ///
    /// Errs without consuming `b` if `carry` would grow past
    /// `max_carry_bytes` (`esi.max_carry_bytes`) — a live prefix candidate
    /// straddling fragment boundaries forever would otherwise grow the
    /// carry buffer without bound.
    pub fn feed_byte(
        &self,
        carry: &mut Vec<u8>,
        b: u8,
        max_carry_bytes: usize,
    ) -> Result<MatchResult<T>, FetchError> {
        if carry.len() >= max_carry_bytes {
            return Err(FetchError::Filter(format!(
                "esi match-table carry exceeded max_carry_bytes ({max_carry_bytes})"
            )));
        }
        carry.push(b);
        let mut any_consuming = false;
        for entry in self.entries {
            if carry.len() <= entry.needle.len() && carry[..] == entry.needle[..carry.len()] {
                if carry.len() == entry.needle.len() {
                    carry.clear();
                    return Ok(MatchResult::Hit(entry.target));
                }
                any_consuming = true;
            }
        }
        if any_consuming {
            Ok(MatchResult::Indeterminate)
        } else {
            carry.clear();
            Ok(MatchResult::Fallback(self.fallback))
        }
    }
}
