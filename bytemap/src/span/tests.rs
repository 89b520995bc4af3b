use super::*;
use crate::{
    lint::lint,
    parse::{parse_file, ParseOptions, ParseResult},
    reader::Reader,
};
use hex_literal::hex;
use std::io::Write;
use tempfile::NamedTempFile;
use test_case::test_case;

const FIXED: &str = r#"
{
  format: record_stream,
  endian: little,
  types: {
    Record: {
      fields: [
        { name: type, type: u16 },
        { name: length, type: u8 },
        { name: data, type: bytes, length: length },
      ],
    },
  },
}
"#;

fn parse_fixture() -> ParseResult {
    let report = lint(FIXED);
    let grammar = report.grammar.unwrap();
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(&hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44"))
        .unwrap();
    f.flush().unwrap();
    let reader = Reader::open(f.path()).unwrap();
    parse_file(&grammar, &reader, &ParseOptions::default())
}

#[test]
fn full_viewport_emits_all_leaves() {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    let set = gen.generate(0, 16);
    assert_eq!(6, set.spans().len());
    // Sorted and disjoint.
    for pair in set.spans().windows(2) {
        assert!(pair[0].end() <= pair[1].offset);
    }
}

#[test]
fn spans_intersect_the_viewport() {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    let set = gen.generate(3, 9);
    for s in set.spans() {
        assert!(s.offset < 9 && s.end() > 3, "span {s:?} outside viewport");
    }
    // data of record 0 ([3,8)) and type of record 1 ([8,10)).
    assert!(set.spans().iter().any(|s| s.path == "data" && s.offset == 3));
    assert!(set.spans().iter().any(|s| s.path == "type" && s.offset == 8));
}

#[test_case(0, 0; "empty viewport")]
#[test_case(9, 3; "inverted viewport")]
#[test_case(100, 200; "beyond eof")]
fn degenerate_viewports(start: u64, end: u64) {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    assert!(gen.generate(start, end).spans().is_empty());
}

#[test]
fn unchanged_viewport_returns_cached_set() {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    let a = gen.generate(0, 16);
    let b = gen.generate(0, 16);
    assert!(Arc::ptr_eq(&a, &b));
    let c = gen.generate(0, 8);
    assert!(!Arc::ptr_eq(&a, &c));
}

#[test]
fn span_metadata() {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    let set = gen.generate(0, 16);
    let data = set.find(3).unwrap();
    assert_eq!("data", data.path);
    assert_eq!(crate::grammar::SpanGroup::Bytes, data.group);
    let ty = set.find(0).unwrap();
    assert_eq!(crate::grammar::SpanGroup::Int, ty.group);
}

#[test]
fn index_find_covers_span_extent() {
    let result = parse_fixture();
    let mut gen = SpanGenerator::new(&result);
    let set = gen.generate(0, 16);
    for s in set.spans().to_vec() {
        assert_eq!(Some(&s), set.find(s.offset));
        assert_eq!(Some(&s), set.find(s.offset + s.length - 1));
    }
}

#[test]
fn index_misses_between_spans() {
    let spans = vec![
        Span {
            offset: 0,
            length: 2,
            path: "a".to_owned(),
            group: crate::grammar::SpanGroup::Int,
            endian: crate::grammar::Endian::Little,
            endian_source: crate::grammar::EndianSource::Default,
            color: None,
        },
        Span {
            offset: 6,
            length: 2,
            path: "b".to_owned(),
            group: crate::grammar::SpanGroup::Int,
            endian: crate::grammar::Endian::Little,
            endian_source: crate::grammar::EndianSource::Default,
            color: None,
        },
    ];
    let index = SpanIndex::new(spans);
    assert_eq!(Some("a"), index.find(1).map(|s| s.path.as_str()));
    assert_eq!(None, index.find(3));
    assert_eq!(None, index.find(4));
    assert_eq!(Some("b"), index.find(6).map(|s| s.path.as_str()));
    assert_eq!(None, index.find(8));
}

#[test]
fn error_records_are_excluded() {
    let result = parse_fixture();
    let mut bad = result.clone();
    bad.records[0].error = Some(crate::parse::ParseError::EmptyRecord { offset: 0 });
    let mut gen = SpanGenerator::new(&bad);
    let set = gen.generate(0, 16);
    // Only record 1's three leaves remain.
    assert_eq!(3, set.spans().len());
    assert!(set.spans().iter().all(|s| s.offset >= 8));
}

#[test]
fn empty_result_produces_no_spans() {
    let result = parse_fixture();
    let mut empty = result.clone();
    empty.records.clear();
    let mut gen = SpanGenerator::new(&empty);
    assert!(gen.generate(0, 100).spans().is_empty());
}
