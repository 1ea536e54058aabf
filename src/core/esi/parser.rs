// src/core/esi/parser.rs

//! C3: the VEP state machine. Byte-fed, re-entrant, and fragmentation
//! invariant by construction — every byte is folded through `step` exactly
//! once regardless of how the caller chunks its `feed()` calls, and all
//! "memory" (match-table carry, attribute buffers, the esi-comment flag)
//! lives in `VepParser` itself rather than on a call stack.
//!
//! Recognizes: `<!-- -->` comments (with the `<!--esi ... -->` unwrap
//! form), `<![CDATA[ ... ]]>` opaque regions, `<esi:include src="...">`,
//! `<esi:remove>...</esi:remove>`, `<esi:comment/>`, and passes all other
//! tags and text through verbatim.

use crate::core::errors::FetchError;
use crate::core::esi::match_table::{MatchEntry, MatchResult, MatchTable};
use crate::core::esi::vec_program::VecBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTarget {
    Comment,
    EsiTag,
    EsiEndTag,
    Cdata,
    NotMyTag,
}

const START_TABLE: MatchTable<StartTarget> = MatchTable {
    entries: &[
        MatchEntry { needle: b"<!--", target: StartTarget::Comment },
        MatchEntry { needle: b"</esi:", target: StartTarget::EsiEndTag },
        MatchEntry { needle: b"<esi:", target: StartTarget::EsiTag },
        MatchEntry { needle: b"<![CDATA[", target: StartTarget::Cdata },
    ],
    fallback: StartTarget::NotMyTag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentKind {
    Esi,
    Regular,
}

const COMMENT_TABLE: MatchTable<CommentKind> = MatchTable {
    entries: &[MatchEntry { needle: b"esi", target: CommentKind::Esi }],
    fallback: CommentKind::Regular,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EsiTagKind {
    Include,
    Remove,
    Comment,
    Unknown,
}

const ESI_TAG_TABLE: MatchTable<EsiTagKind> = MatchTable {
    entries: &[
        MatchEntry { needle: b"include", target: EsiTagKind::Include },
        MatchEntry { needle: b"remove", target: EsiTagKind::Remove },
        MatchEntry { needle: b"comment", target: EsiTagKind::Comment },
    ],
    fallback: EsiTagKind::Unknown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrKind {
    Src,
    Other,
}

const ATTR_TABLE: MatchTable<AttrKind> = MatchTable {
    entries: &[MatchEntry { needle: b"src=", target: AttrKind::Src }],
    fallback: AttrKind::Other,
};

/// A simple substring scanner used for `-->`, `]]>`, and the end tags.
#[derive(Debug, Clone)]
struct UntilScanner {
    magic: &'static [u8],
    matched: usize,
}

impl UntilScanner {
    fn new(magic: &'static [u8]) -> Self {
        Self { magic, matched: 0 }
    }

    /// Feeds one byte; returns `true` exactly when `magic` has just been
    /// fully matched (and resets for reuse).
    fn feed(&mut self, b: u8) -> bool {
        loop {
            if self.magic[self.matched] == b {
                self.matched += 1;
                if self.matched == self.magic.len() {
                    self.matched = 0;
                    return true;
                }
                return false;
            } else if self.matched == 0 {
                return false;
            } else {
                self.matched = 0;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteDelim {
    Single,
    Double,
}

#[derive(Debug, Clone)]
enum IncludeSub {
    SkipWs,
    MatchAttrName(Vec<u8>),
    /// Just matched an attribute name (`=` consumed); the next byte must be
    /// the opening quote.
    AwaitValueQuote { is_src: bool },
    InUnknownValue { delim: QuoteDelim },
    InSrcValue { delim: QuoteDelim, buf: Vec<u8> },
}

#[derive(Debug, Clone)]
enum St {
    /// Scanning plain content, watching for `<`.
    Text,
    /// Just consumed `<`; matching the start table.
    TagStart(Vec<u8>),
    /// Inside a non-ESI tag; scan verbatim to `>`.
    NotMyTag,
    /// Just matched `<!--`; deciding esi-comment vs regular comment.
    Comment(Vec<u8>),
    /// Inside a regular (non-esi) comment; scan to `-->`, kept verbatim.
    CommentBody(UntilScanner),
    /// Inside `<![CDATA[ ... ]]>`; kept verbatim, not scanned for tags.
    CdataBody(UntilScanner),
    /// Just matched `<esi:`; matching include/remove/comment.
    EsiTagMatch(Vec<u8>),
    /// Just matched `</esi:`; matching `remove` (stray end tag).
    EsiEndTagMatch(Vec<u8>),
    /// Inside `<esi:include ...>`, scanning attributes.
    IncludeAttrs { sub: IncludeSub, src: Option<String>, self_close: bool },
    /// After a non-self-closing `<esi:include>`, scanning for its end tag.
    IncludeAwaitEnd(UntilScanner),
    /// Scanning to `>` for `<esi:remove>`'s opening tag.
    RemoveOpenTag,
    /// Inside `<esi:remove>...</esi:remove>`, entirely suppressed.
    RemoveBody(UntilScanner),
    /// Scanning to `>` for `<esi:comment .../>` (self-closing, no body).
    CommentTagToClose,
    /// Scanning to `>` for an unrecognized `<esi:...>` directive.
    UnknownEsiTag,
    /// Scanning to `>` for a stray `</esi:remove>` with no matching open tag.
    StrayEndTagToClose,
}

/// The ESI parser's entity: current state, in-progress match carry buffers,
/// the esi-comment flag, and the VEC output builder.
pub struct VepParser {
    state: St,
    pos: u64,
    vec: VecBuilder,
    in_esi_comment: bool,
    esi_comment_end: UntilScanner,
    /// Bound on every match-table carry buffer this parser owns (`esi.max_carry_bytes`).
    max_carry_bytes: usize,
}

impl VepParser {
    pub fn new(max_carry_bytes: usize) -> Self {
        Self {
            state: St::Text,
            pos: 0,
            vec: VecBuilder::new(),
            in_esi_comment: false,
            esi_comment_end: UntilScanner::new(b"-->"),
            max_carry_bytes,
        }
    }

    /// Feeds a chunk of input. May be called any number of times with
    /// arbitrarily small fragments; the output is identical regardless of
    /// how the caller partitions the body (the fragmentation invariant).
    /// Errs if a tag/attribute straddling a fragment boundary grows its
    /// carry buffer past `max_carry_bytes`.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), FetchError> {
        for &b in data {
            self.step(b)?;
        }
        Ok(())
    }

    /// Signals end of body and returns the finished VEC program.
    pub fn finish(mut self) -> Vec<u8> {
        self.vec.mark_verbatim(self.pos);
        self.vec.finish()
    }

    fn step(&mut self, b: u8) -> Result<(), FetchError> {
        let pos_before = self.pos;
        self.dispatch(b, pos_before)?;
        self.pos += 1;
        Ok(())
    }

    fn dispatch(&mut self, b: u8, pos_before: u64) -> Result<(), FetchError> {
        let max_carry = self.max_carry_bytes;
        match std::mem::replace(&mut self.state, St::Text) {
            St::Text => self.in_text(b, pos_before)?,
            St::TagStart(mut carry) => {
                match START_TABLE.feed_byte(&mut carry, b, max_carry)? {
                    MatchResult::Hit(StartTarget::Comment) => {
                        self.state = St::Comment(Vec::new());
                    }
                    MatchResult::Hit(StartTarget::EsiEndTag) => {
                        self.state = St::EsiEndTagMatch(Vec::new());
                    }
                    MatchResult::Hit(StartTarget::EsiTag) => {
                        self.state = St::EsiTagMatch(Vec::new());
                    }
                    MatchResult::Hit(StartTarget::Cdata) => {
                        self.state = St::CdataBody(UntilScanner::new(b"]]>"));
                    }
                    MatchResult::Fallback(StartTarget::NotMyTag) => {
                        if b == b'>' {
                            self.vec.mark_verbatim(self.pos + 1);
                            self.state = St::Text;
                        } else {
                            self.state = St::NotMyTag;
                        }
                    }
                    MatchResult::Indeterminate => {
                        self.state = St::TagStart(carry);
                    }
                    MatchResult::Hit(StartTarget::NotMyTag)
                    | MatchResult::Fallback(_) => unreachable!("NotMyTag is only a fallback target"),
                }
            }
            St::NotMyTag => {
                if b == b'>' {
                    self.vec.mark_verbatim(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::NotMyTag;
                }
            }
            St::Comment(mut carry) => match COMMENT_TABLE.feed_byte(&mut carry, b, max_carry)? {
                MatchResult::Hit(CommentKind::Esi) => {
                    self.vec.mark_skip(self.pos + 1);
                    self.in_esi_comment = true;
                    self.esi_comment_end = UntilScanner::new(b"-->");
                    self.state = St::Text;
                }
                MatchResult::Fallback(CommentKind::Regular) => {
                    self.state = St::CommentBody(UntilScanner::new(b"-->"));
                }
                MatchResult::Indeterminate => {
                    self.state = St::Comment(carry);
                }
                MatchResult::Hit(CommentKind::Regular) | MatchResult::Fallback(CommentKind::Esi) => {
                    unreachable!("Regular is fallback-only and Esi is hit-only in COMMENT_TABLE")
                }
            },
            St::CommentBody(mut scanner) => {
                if scanner.feed(b) {
                    self.vec.mark_verbatim(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::CommentBody(scanner);
                }
            }
            St::CdataBody(mut scanner) => {
                if scanner.feed(b) {
                    self.vec.mark_verbatim(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::CdataBody(scanner);
                }
            }
            St::EsiTagMatch(mut carry) => match ESI_TAG_TABLE.feed_byte(&mut carry, b, max_carry)? {
                MatchResult::Hit(EsiTagKind::Include) => {
                    self.state = St::IncludeAttrs {
                        sub: IncludeSub::SkipWs,
                        src: None,
                        self_close: false,
                    };
                }
                MatchResult::Hit(EsiTagKind::Remove) => {
                    self.state = St::RemoveOpenTag;
                }
                MatchResult::Hit(EsiTagKind::Comment) => {
                    self.state = St::CommentTagToClose;
                }
                MatchResult::Fallback(EsiTagKind::Unknown) => {
                    self.state = St::UnknownEsiTag;
                }
                MatchResult::Indeterminate => {
                    self.state = St::EsiTagMatch(carry);
                }
                MatchResult::Hit(EsiTagKind::Unknown)
                | MatchResult::Fallback(EsiTagKind::Include)
                | MatchResult::Fallback(EsiTagKind::Remove)
                | MatchResult::Fallback(EsiTagKind::Comment) => {
                    unreachable!("Unknown is fallback-only and the rest are hit-only in ESI_TAG_TABLE")
                }
            },
            St::EsiEndTagMatch(mut carry) => {
                match ESI_END_TABLE.feed_byte(&mut carry, b, max_carry)? {
                    MatchResult::Hit(()) => {
                        self.state = St::StrayEndTagToClose;
                    }
                    MatchResult::Fallback(()) => {
                        self.state = St::UnknownEsiTag;
                    }
                    MatchResult::Indeterminate => {
                        self.state = St::EsiEndTagMatch(carry);
                    }
                }
            }
            St::IncludeAttrs { sub, src, self_close } => {
                self.step_include_attrs(b, sub, src, self_close)?;
            }
            St::IncludeAwaitEnd(mut scanner) => {
                if scanner.feed(b) {
                    self.vec.mark_skip(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::IncludeAwaitEnd(scanner);
                }
            }
            St::RemoveOpenTag => {
                if b == b'>' {
                    self.state = St::RemoveBody(UntilScanner::new(b"</esi:remove>"));
                } else {
                    self.state = St::RemoveOpenTag;
                }
            }
            St::RemoveBody(mut scanner) => {
                if scanner.feed(b) {
                    self.vec.mark_skip(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::RemoveBody(scanner);
                }
            }
            St::CommentTagToClose => {
                if b == b'>' {
                    self.vec.mark_skip(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::CommentTagToClose;
                }
            }
            St::UnknownEsiTag => {
                if b == b'>' {
                    self.vec.mark_skip(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::UnknownEsiTag;
                }
            }
            St::StrayEndTagToClose => {
                if b == b'>' {
                    self.vec.mark_skip(self.pos + 1);
                    self.state = St::Text;
                } else {
                    self.state = St::StrayEndTagToClose;
                }
            }
        }
        Ok(())
    }

    fn in_text(&mut self, b: u8, pos_before: u64) -> Result<(), FetchError> {
        if self.in_esi_comment && self.esi_comment_end.feed(b) {
            self.vec.mark_skip(self.pos + 1);
            self.in_esi_comment = false;
            self.state = St::Text;
            return Ok(());
        }
        if b == b'<' {
            self.vec.mark_verbatim(pos_before);
            self.state = St::TagStart(Vec::new());
            // Feed the '<' itself into the fresh match carry.
            if let St::TagStart(ref mut carry) = self.state {
                match START_TABLE.feed_byte(carry, b, self.max_carry_bytes)? {
                    MatchResult::Indeterminate => {}
                    MatchResult::Hit(_) | MatchResult::Fallback(_) => {
                        unreachable!("a single '<' can never resolve a 4+ byte needle table")
                    }
                }
            }
        } else {
            self.state = St::Text;
        }
        Ok(())
    }

    fn step_include_attrs(
        &mut self,
        b: u8,
        sub: IncludeSub,
        src: Option<String>,
        self_close: bool,
    ) -> Result<(), FetchError> {
        match sub {
            IncludeSub::SkipWs => {
                if b.is_ascii_whitespace() {
                    self.state = St::IncludeAttrs { sub: IncludeSub::SkipWs, src, self_close };
                } else if b == b'/' {
                    self.state = St::IncludeAttrs { sub: IncludeSub::SkipWs, src, self_close: true };
                } else if b == b'>' {
                    self.finish_include_open_tag(src, self_close);
                } else {
                    self.state = St::IncludeAttrs {
                        sub: IncludeSub::MatchAttrName(vec![b]),
                        src,
                        self_close,
                    };
                }
            }
            IncludeSub::MatchAttrName(mut carry) => {
                // Re-drive the match incrementally against the accumulated name bytes.
                carry.push(b);
                match classify_attr(&carry, self.max_carry_bytes)? {
                    MatchResult::Hit(AttrKind::Src) => {
                        self.state = St::IncludeAttrs {
                            sub: IncludeSub::AwaitValueQuote { is_src: true },
                            src,
                            self_close,
                        };
                    }
                    MatchResult::Fallback(AttrKind::Other) => {
                        self.state = St::IncludeAttrs {
                            sub: IncludeSub::AwaitValueQuote { is_src: false },
                            src,
                            self_close,
                        };
                    }
                    MatchResult::Indeterminate => {
                        self.state = St::IncludeAttrs {
                            sub: IncludeSub::MatchAttrName(carry),
                            src,
                            self_close,
                        };
                    }
                    MatchResult::Hit(AttrKind::Other) | MatchResult::Fallback(AttrKind::Src) => {
                        unreachable!("Other is fallback-only and Src is hit-only in ATTR_TABLE")
                    }
                }
            }
            IncludeSub::AwaitValueQuote { is_src } => {
                if b == b'"' {
                    self.state = St::IncludeAttrs {
                        sub: if is_src {
                            IncludeSub::InSrcValue { delim: QuoteDelim::Double, buf: Vec::new() }
                        } else {
                            IncludeSub::InUnknownValue { delim: QuoteDelim::Double }
                        },
                        src,
                        self_close,
                    };
                } else if b == b'\'' {
                    self.state = St::IncludeAttrs {
                        sub: if is_src {
                            IncludeSub::InSrcValue { delim: QuoteDelim::Single, buf: Vec::new() }
                        } else {
                            IncludeSub::InUnknownValue { delim: QuoteDelim::Single }
                        },
                        src,
                        self_close,
                    };
                } else if b.is_ascii_whitespace() {
                    // Malformed (no value); treat the name as valueless and move on.
                    self.state = St::IncludeAttrs { sub: IncludeSub::SkipWs, src, self_close };
                } else if b == b'>' {
                    self.finish_include_open_tag(src, self_close);
                } else {
                    // Unquoted value start; not supported, conservatively skip to next attr.
                    self.state = St::IncludeAttrs { sub: IncludeSub::AwaitValueQuote { is_src }, src, self_close };
                }
            }
            IncludeSub::InUnknownValue { delim } => {
                let closes = matches!((delim, b), (QuoteDelim::Double, b'"') | (QuoteDelim::Single, b'\''));
                if closes {
                    self.state = St::IncludeAttrs { sub: IncludeSub::SkipWs, src, self_close };
                } else {
                    self.state = St::IncludeAttrs { sub: IncludeSub::InUnknownValue { delim }, src, self_close };
                }
            }
            IncludeSub::InSrcValue { delim, mut buf } => {
                let closes = matches!((delim, b), (QuoteDelim::Double, b'"') | (QuoteDelim::Single, b'\''));
                if closes {
                    let value = String::from_utf8_lossy(&buf).into_owned();
                    self.state = St::IncludeAttrs { sub: IncludeSub::SkipWs, src: Some(value), self_close };
                } else if buf.len() >= self.max_carry_bytes {
                    return Err(FetchError::Filter(format!(
                        "esi src attribute exceeded max_carry_bytes ({})",
                        self.max_carry_bytes
                    )));
                } else {
                    buf.push(b);
                    self.state = St::IncludeAttrs { sub: IncludeSub::InSrcValue { delim, buf }, src, self_close };
                }
            }
        }
        Ok(())
    }

    fn finish_include_open_tag(&mut self, src: Option<String>, self_close: bool) {
        match src {
            Some(src) => {
                // The tag's own source text is replaced by the Include op, not
                // additionally recorded as a Skip run over the same bytes.
                self.vec.advance_silently(self.pos + 1);
                self.vec.emit_include(&src);
            }
            None => {
                // No src attribute: nothing to include, so the malformed tag is
                // simply suppressed like any other unrecognized directive.
                self.vec.mark_skip(self.pos + 1);
            }
        }
        if self_close {
            self.state = St::Text;
        } else {
            self.state = St::IncludeAwaitEnd(UntilScanner::new(b"</esi:include>"));
        }
    }
}

const ESI_END_TABLE: MatchTable<()> = MatchTable {
    entries: &[MatchEntry { needle: b"remove", target: () }],
    fallback: (),
};

/// Classifies accumulated attribute-name bytes against the one-entry table
/// without consuming a fresh `MatchTable` carry type mismatch (the table
/// machinery expects a single shared carry buffer per match; attribute name
/// matching re-derives the same decision from the locally accumulated bytes
/// each step, which is equivalent since the table has no side effects).
fn classify_attr(carry: &[u8], max_carry_bytes: usize) -> Result<MatchResult<AttrKind>, FetchError> {
    let mut scratch = Vec::new();
    let mut last = MatchResult::Indeterminate;
    for &b in carry {
        last = ATTR_TABLE.feed_byte(&mut scratch, b, max_carry_bytes)?;
        if !matches!(last, MatchResult::Indeterminate) {
            return Ok(last);
        }
    }
    Ok(last)
}
