// tests/esi_parser_tests.rs

//! End-to-end coverage of the VEP parser against the testable-property
//! scenarios: a plain include (S5) and an `<!--esi ... -->` comment
//! unwrap (S6).

use ferrocache::core::esi::vec_program::decode;
use ferrocache::core::esi::{VecOp, VepParser};

fn parse(input: &[u8]) -> Vec<VecOp> {
    let mut parser = VepParser::new(1024);
    parser.feed(input).unwrap();
    decode(&parser.finish())
}

#[test]
fn include_tag_splits_surrounding_text_into_two_verbatim_runs() {
    let ops = parse(b"<html><esi:include src=\"/a\"/>Hi</html>");
    assert_eq!(
        ops,
        vec![
            VecOp::Verbatim(6),
            VecOp::Include("/a".to_string()),
            VecOp::Verbatim(9),
        ]
    );
}

#[test]
fn esi_comment_is_unwrapped_stripping_the_wrapper_as_skip_runs() {
    // The `<!--esi` / `-->` wrapper bytes are Skip (never delivered); the
    // inner markup, including the leading space and nested tags, comes
    // through as one contiguous Verbatim run.
    let ops = parse(b"<!--esi <b>x</b>-->");
    assert_eq!(
        ops,
        vec![VecOp::Skip(7), VecOp::Verbatim(9), VecOp::Skip(3)]
    );
}

#[test]
fn plain_comment_without_esi_marker_passes_through_as_verbatim() {
    // Only a `<!--esi ... -->` comment is special; an ordinary HTML comment
    // is not ESI markup and is left in the output untouched.
    let input = b"a<!-- not esi -->b";
    let ops = parse(input);
    assert_eq!(ops, vec![VecOp::Verbatim(input.len() as u64)]);
}

#[test]
fn fragmentation_does_not_change_the_program() {
    // Feeding the same input in many small pieces must produce exactly the
    // program a single feed() call would, regardless of where the splits
    // land relative to tag boundaries.
    let whole = b"<html><esi:include src=\"/a\"/>Hi</html>".to_vec();

    let mut whole_parser = VepParser::new(1024);
    whole_parser.feed(&whole).unwrap();
    let whole_program = whole_parser.finish();

    let mut fragmented_parser = VepParser::new(1024);
    for byte in &whole {
        fragmented_parser.feed(std::slice::from_ref(byte)).unwrap();
    }
    let fragmented_program = fragmented_parser.finish();

    assert_eq!(whole_program, fragmented_program);
}

#[test]
fn include_with_no_surrounding_text_emits_no_verbatim_runs() {
    let ops = parse(b"<esi:include src=\"/only\"/>");
    assert_eq!(ops, vec![VecOp::Include("/only".to_string())]);
}
