use super::*;
use crate::{grammar::Grammar, lint::lint, reader::Reader};
use hex_literal::hex;
use std::io::Write;
use tempfile::NamedTempFile;
use test_case::test_case;
use test_log::test;

fn grammar(text: &str) -> Grammar {
    let report = lint(text);
    assert!(report.success(), "lint failed: {:?}", report.errors);
    report.grammar.unwrap()
}

fn data_file(bytes: &[u8]) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

fn parse_bytes(text: &str, bytes: &[u8]) -> ParseResult {
    parse_with(text, bytes, &ParseOptions::default())
}

fn parse_with(text: &str, bytes: &[u8], options: &ParseOptions) -> ParseResult {
    let g = grammar(text);
    let f = data_file(bytes);
    let reader = Reader::open(f.path()).unwrap();
    parse_file(&g, &reader, options)
}

const FIXED: &str = r#"
{
  format: record_stream,
  endian: little,
  framing: { repeat: until_eof },
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

#[test]
fn length_prefixed_records() {
    let result = parse_bytes(FIXED, &hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44"));
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(2, result.record_count());
    assert_eq!(16, result.total_bytes_parsed);
    assert_eq!(16, result.parse_stopped_at);

    let r0 = &result.records[0];
    assert_eq!(0, r0.offset);
    assert_eq!(8, r0.size);
    assert_eq!(Some(1), r0.leaf("type").unwrap().value.as_ref().unwrap().as_u64());
    assert_eq!(Some(5), r0.leaf("length").unwrap().value.as_ref().unwrap().as_u64());
    assert_eq!(
        Some(b"HELLO".as_slice()),
        r0.leaf("data").unwrap().value.as_ref().unwrap().as_bytes()
    );
    let r1 = &result.records[1];
    assert_eq!(8, r1.offset);
    assert_eq!(
        Some(b"WORLD".as_slice()),
        r1.leaf("data").unwrap().value.as_ref().unwrap().as_bytes()
    );
}

#[test]
fn empty_file_is_not_an_error() {
    let result = parse_bytes(FIXED, b"");
    assert_eq!(0, result.record_count());
    assert!(result.errors.is_empty());
    assert_eq!(0, result.total_bytes_parsed);
}

#[test]
fn start_offset_skips_records() {
    let result = parse_with(
        FIXED,
        &hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44"),
        &ParseOptions {
            start_offset: 8,
            ..Default::default()
        },
    );
    assert_eq!(1, result.record_count());
    assert_eq!(16, result.parse_stopped_at);
    assert_eq!(8, result.records[0].offset);
}

#[test]
fn byte_limit_bounds_the_parse() {
    let result = parse_with(
        FIXED,
        &hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44"),
        &ParseOptions {
            byte_limit: Some(10),
            ..Default::default()
        },
    );
    assert_eq!(1, result.record_count());
}

#[test]
fn max_records_caps_the_loop() {
    let result = parse_with(
        FIXED,
        &hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44"),
        &ParseOptions {
            max_records: Some(1),
            ..Default::default()
        },
    );
    assert_eq!(1, result.record_count());
}

#[test]
fn parse_is_deterministic() {
    let bytes = hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F 52 4C 44");
    let g = grammar(FIXED);
    let f = data_file(&bytes);
    let reader = Reader::open(f.path()).unwrap();
    let a = parse_file(&g, &reader, &ParseOptions::default());
    let b = parse_file(&g, &reader, &ParseOptions::default());
    // Timestamps differ; equality ignores them.
    assert_eq!(a, b);
}

#[test]
fn truncated_last_record_reports_field_errors() {
    let result = parse_bytes(FIXED, &hex!("01 00 05 48 45 4C 4C 4F 02 00 05 57 4F"));
    assert_eq!(2, result.record_count());
    let r1 = &result.records[1];
    let data = r1.leaf("data").unwrap();
    assert!(matches!(
        data.error,
        Some(ParseError::FieldOutOfBounds { .. })
    ));
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::FieldOutOfBounds { .. })));
}

// ---- endianness ----

const ENDIAN: &str = r#"
{
  format: record_stream,
  endian: big,
  types: {
    Record: {
      fields: [
        { name: plain, type: u16 },
        { name: swapped, type: u16, endian: little },
        { name: inner, type: struct, endian: little, fields: [
          { name: nested, type: u16 },
        ]},
      ],
    },
  },
}
"#;

#[test]
fn endian_resolution_and_sources() {
    let result = parse_bytes(ENDIAN, &hex!("00 01 00 01 00 01"));
    let r = &result.records[0];

    let plain = r.leaf("plain").unwrap();
    assert_eq!(Some(1), plain.value.as_ref().unwrap().as_u64());
    assert_eq!((Endian::Big, EndianSource::Root), (plain.endian, plain.endian_source));

    let swapped = r.leaf("swapped").unwrap();
    assert_eq!(Some(0x0100), swapped.value.as_ref().unwrap().as_u64());
    assert_eq!(
        (Endian::Little, EndianSource::Field),
        (swapped.endian, swapped.endian_source)
    );

    let nested = r.leaf("inner.nested").unwrap();
    assert_eq!(Some(0x0100), nested.value.as_ref().unwrap().as_u64());
    assert_eq!(
        (Endian::Little, EndianSource::Parent),
        (nested.endian, nested.endian_source)
    );
}

#[test]
fn type_level_endian_reports_type_source() {
    let text = r#"
{
  format: record_stream,
  types: {
    Record: { endian: big, fields: [ { name: v, type: u16 } ] },
  },
}
"#;
    let result = parse_bytes(text, &hex!("00 02"));
    let v = result.records[0].leaf("v").unwrap();
    assert_eq!(Some(2), v.value.as_ref().unwrap().as_u64());
    assert_eq!((Endian::Big, EndianSource::Type), (v.endian, v.endian_source));
}

#[test]
fn default_endian_is_little() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [ { name: v, type: u16 } ] } } }
"#;
    let result = parse_bytes(text, &hex!("02 00"));
    let v = result.records[0].leaf("v").unwrap();
    assert_eq!(Some(2), v.value.as_ref().unwrap().as_u64());
    assert_eq!(
        (Endian::Little, EndianSource::Default),
        (v.endian, v.endian_source)
    );
}

#[test]
fn colors_inherit_unless_overridden() {
    let text = r##"
{
  format: record_stream,
  types: {
    Record: {
      color: blue,
      fields: [
        { name: plain, type: u8 },
        { name: tinted, type: u8, color: "#ABC" },
        { name: inner, type: struct, color: red, fields: [
          { name: nested, type: u8 },
        ]},
      ],
    },
  },
}
"##;
    let result = parse_bytes(text, &hex!("01 02 03"));
    let r = &result.records[0];
    let color_of = |path: &str| {
        r.leaf(path)
            .unwrap()
            .color
            .as_ref()
            .map(|c| c.as_str().to_owned())
    };
    assert_eq!(Some("blue".to_owned()), color_of("plain"));
    assert_eq!(Some("#aabbcc".to_owned()), color_of("tinted"));
    assert_eq!(Some("red".to_owned()), color_of("inner.nested"));
}

// ---- numeric decoding ----

#[test_case("i8", &hex!("FF"), -1; "i8 negative")]
#[test_case("i16", &hex!("FE FF"), -2; "i16 negative le")]
#[test_case("i32", &hex!("FF FF FF FF"), -1; "i32 negative")]
#[test_case("i64", &hex!("00 00 00 00 00 00 00 80"), i64::MIN; "i64 min")]
fn signed_decoding(kind: &str, bytes: &[u8], exp: i64) {
    let text = format!(
        "{{format: record_stream, endian: little, types: {{R: {{fields: [{{name: v, type: {kind}}}]}}}}}}"
    );
    let result = parse_bytes(&text, bytes);
    assert_eq!(
        Some(exp),
        result.records[0].leaf("v").unwrap().value.as_ref().unwrap().as_i64()
    );
}

#[test]
fn float_decoding() {
    let text =
        "{format: record_stream, endian: little, types: {R: {fields: [{name: v, type: f32}]}}}";
    let result = parse_bytes(text, &1.5f32.to_le_bytes());
    let v = result.records[0].leaf("v").unwrap();
    assert!(matches!(v.value, Some(ParsedValue::Float(f)) if f == 1.5));
}

#[test]
fn u64_values_survive() {
    let text =
        "{format: record_stream, endian: little, types: {R: {fields: [{name: v, type: u64}]}}}";
    let result = parse_bytes(text, &u64::MAX.to_le_bytes());
    assert_eq!(
        Some(u64::MAX),
        result.records[0].leaf("v").unwrap().value.as_ref().unwrap().as_u64()
    );
}

// ---- layout ----

#[test]
fn offset_and_skip_layout() {
    let text = r#"
{
  format: record_stream,
  types: {
    R: {
      fields: [
        { name: a, type: u8 },
        { name: b, type: u8, skip: 2 },
        { name: c, type: u8, offset: 6 },
      ],
    },
  },
}
"#;
    let result = parse_bytes(text, &hex!("AA 00 00 BB 00 00 CC"));
    let r = &result.records[0];
    assert_eq!(0, r.leaf("a").unwrap().offset);
    assert_eq!(3, r.leaf("b").unwrap().offset);
    assert_eq!(6, r.leaf("c").unwrap().offset);
    assert_eq!(Some(0xCC), r.leaf("c").unwrap().value.as_ref().unwrap().as_u64());
    assert_eq!(7, r.size);
}

// ---- strings ----

#[test]
fn null_terminated_string_consumes_max_length() {
    let text = r#"
{
  format: record_stream,
  types: {
    R: { fields: [
      { name: s, type: string, null_terminated: true, max_length: 8 },
      { name: tail, type: u8 },
    ]},
  },
}
"#;
    let mut bytes = b"abc\0defg".to_vec();
    bytes.push(0x7F);
    let result = parse_bytes(text, &bytes);
    let r = &result.records[0];
    let s = r.leaf("s").unwrap();
    assert_eq!(Some("abc"), s.value.as_ref().unwrap().as_str());
    assert_eq!(8, s.length);
    assert_eq!(8, r.leaf("tail").unwrap().offset);
}

#[test]
fn utf16le_string() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: s, type: string, length: 8, encoding: "utf-16le" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("48 00 69 00 21 00 21 00"));
    assert_eq!(
        Some("Hi!!"),
        result.records[0].leaf("s").unwrap().value.as_ref().unwrap().as_str()
    );
}

#[test]
fn ascii_replaces_high_bytes() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: s, type: string, length: 3 },
]}}}
"#;
    let result = parse_bytes(text, &hex!("41 FF 42"));
    assert_eq!(
        Some("A\u{FFFD}B"),
        result.records[0].leaf("s").unwrap().value.as_ref().unwrap().as_str()
    );
}

#[test]
fn bytes_with_encoding_decode_to_text() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: len, type: u8 },
  { name: note, type: bytes, length: len, encoding: ascii },
]}}}
"#;
    let result = parse_bytes(text, b"\x05Hello");
    assert_eq!(
        Some("Hello"),
        result.records[0].leaf("note").unwrap().value.as_ref().unwrap().as_str()
    );
}

// ---- dynamic lengths ----

#[test]
fn expression_length() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: total, type: u16 },
  { name: body, type: bytes, length: "total - 2" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("06 00 AA BB CC DD"));
    let body = result.records[0].leaf("body").unwrap();
    assert_eq!(4, body.length);
    assert!(result.errors.is_empty());
}

#[test]
fn negative_length_is_an_error() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: total, type: u16 },
  { name: body, type: bytes, length: "total - 10" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("02 00 AA BB"));
    let body = result.records[0].leaf("body").unwrap();
    assert!(matches!(body.error, Some(ParseError::LengthUnresolved { .. })));
}

#[test]
fn dynamic_length_cap_is_enforced() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: total, type: u32 },
  { name: body, type: bytes, length: "total * 1000" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("40 42 0F 00"));
    let body = result.records[0].leaf("body").unwrap();
    assert!(matches!(
        body.error,
        Some(ParseError::LengthExceedsCap { cap: MAX_DYNAMIC_BYTES, .. })
    ));
}

#[test]
fn parent_scope_length_reference() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: size, type: u8 },
  { name: inner, type: struct, fields: [
    { name: data, type: bytes, length: size },
  ]},
]}}}
"#;
    let result = parse_bytes(text, &hex!("03 AA BB CC"));
    let data = result.records[0].leaf("inner.data").unwrap();
    assert_eq!(3, data.length);
    assert_eq!(1, data.offset);
    assert!(data.error.is_none());
}

// ---- validation ----

#[test]
fn validation_failures_attach_but_do_not_stop() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: magic, type: u16, validate: { equals: 513 } },
  { name: copy, type: u16, validate: { equals_field: magic } },
  { name: pad, type: bytes, length: 2, validate: { all_bytes: 0 } },
]}}}
"#;
    // magic = 0x0201 = 513 ok; copy mismatches; pad has a non-zero byte.
    let result = parse_bytes(text, &hex!("01 02 03 02 00 01"));
    let r = &result.records[0];
    assert!(r.leaf("magic").unwrap().error.is_none());
    assert!(matches!(
        r.leaf("copy").unwrap().error,
        Some(ParseError::ValidationFailed { .. })
    ));
    assert!(matches!(
        r.leaf("pad").unwrap().error,
        Some(ParseError::ValidationFailed { .. })
    ));
    // All three still consumed their bytes.
    assert_eq!(6, r.size);
}

// ---- arrays ----

#[test]
fn fixed_array_with_inferred_stride() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: values, type: array, length: 3, element: { type: u16 } },
]}}}
"#;
    let result = parse_bytes(text, &hex!("01 00 02 00 03 00"));
    let r = &result.records[0];
    assert_eq!(6, r.size);
    for (i, exp) in [1u64, 2, 3].iter().enumerate() {
        let leaf = r.leaf(&format!("values[{i}]")).unwrap();
        assert_eq!((i as u64) * 2, leaf.offset);
        assert_eq!(Some(*exp), leaf.value.as_ref().unwrap().as_u64());
    }
}

#[test]
fn array_of_structs_with_length_reference() {
    let text = r#"
{ format: record_stream, endian: little, types: {
  Point: { fields: [ { name: x, type: u8 }, { name: y, type: u8 } ] },
  R: { fields: [
    { name: count, type: u8 },
    { name: points, type: "array of Point", length: count },
  ]},
}}
"#;
    let result = parse_bytes(text, &hex!("02 0A 0B 0C 0D"));
    let r = &result.records[0];
    assert_eq!(5, r.size);
    assert_eq!(
        Some(0x0C),
        r.leaf("points[1].x").unwrap().value.as_ref().unwrap().as_u64()
    );
    assert_eq!(3, r.leaf("points[1].x").unwrap().offset);
}

#[test]
fn zero_length_array() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: count, type: u8 },
  { name: items, type: array, length: count, element: { type: u16 } },
  { name: tail, type: u8 },
]}}}
"#;
    let result = parse_bytes(text, &hex!("00 55"));
    let r = &result.records[0];
    assert_eq!(2, r.size);
    assert_eq!(Some(0x55), r.leaf("tail").unwrap().value.as_ref().unwrap().as_u64());
}

#[test]
fn array_count_cap() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: count, type: u32 },
  { name: items, type: array, length: count, element: { type: u8 } },
]}}}
"#;
    let result = parse_bytes(text, &hex!("11 27 00 00"));
    // 10001 items exceeds the cap.
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::LengthExceedsCap { cap: MAX_ARRAY_ITEMS, .. })));
}

#[test]
fn variable_element_without_stride_is_an_error() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: len, type: u8 },
  { name: items, type: array, length: 2, element: { type: bytes, length: len } },
]}}}
"#;
    let result = parse_bytes(text, &hex!("01 AA BB"));
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::StrideUnknown { .. })));
}

#[test]
fn explicit_stride_spaces_elements() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: items, type: array, length: 2, stride: 4, element: { type: u8 } },
]}}}
"#;
    let result = parse_bytes(text, &hex!("AA 00 00 00 BB 00 00 00"));
    let r = &result.records[0];
    assert_eq!(8, r.size);
    assert_eq!(4, r.leaf("items[1]").unwrap().offset);
    assert_eq!(Some(0xBB), r.leaf("items[1]").unwrap().value.as_ref().unwrap().as_u64());
}

// ---- struct-of-arrays ----

#[test]
fn soa_columns_are_column_major() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: table, type: array, layout: soa, length: 3, fields: [
    { name: id, type: u8 },
    { name: score, type: u16 },
  ]},
]}}}
"#;
    // Column id: 3 bytes, then column score: 3 u16s.
    let result = parse_bytes(text, &hex!("01 02 03 0A 00 0B 00 0C 00"));
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let r = &result.records[0];
    assert_eq!(9, r.size);

    // Element i of column j sits at base + sum(prior columns) + i * size_j.
    assert_eq!(1, r.leaf("table[1].id").unwrap().offset);
    assert_eq!(3, r.leaf("table[0].score").unwrap().offset);
    assert_eq!(5, r.leaf("table[1].score").unwrap().offset);
    assert_eq!(
        Some(0x0B),
        r.leaf("table[1].score").unwrap().value.as_ref().unwrap().as_u64()
    );

    // Rows are synthesized structs over the column elements.
    let table = &r.nodes[0];
    assert_eq!(3, table.children.len());
    let row1 = &table.children[1];
    assert_eq!("table[1]", row1.path);
    assert_eq!(1, row1.offset);
    assert_eq!(3, row1.length);
    assert_eq!(2, row1.children.len());
}

// ---- chunks ----

#[test]
fn chunk_with_payload_only_length() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: c, type: chunk, length_type: "u16 LE" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("03 00 41 42 43"));
    let r = &result.records[0];
    assert_eq!(5, r.size);
    let length = r.leaf("c.length").unwrap();
    assert_eq!(Some(3), length.value.as_ref().unwrap().as_u64());
    assert_eq!((Endian::Little, EndianSource::Field), (length.endian, length.endian_source));
    let payload = r.leaf("c.payload").unwrap();
    assert_eq!(2, payload.offset);
    assert_eq!(Some(b"ABC".as_slice()), payload.value.as_ref().unwrap().as_bytes());
    assert!(!payload.truncated);
}

#[test]
fn chunk_length_including_header() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: c, type: chunk, length_type: "u16 BE", length_includes_header: true },
]}}}
"#;
    let result = parse_bytes(text, &hex!("00 05 41 42 43"));
    let r = &result.records[0];
    assert_eq!(5, r.size);
    assert_eq!(3, r.leaf("c.payload").unwrap().length);
    assert!(result.errors.is_empty());
}

#[test]
fn chunk_declared_shorter_than_header() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: c, type: chunk, length_type: "u16 LE", length_includes_header: true },
]}}}
"#;
    let result = parse_bytes(text, &hex!("01 00 FF"));
    let r = &result.records[0];
    let chunk = &r.nodes[0];
    assert!(matches!(
        chunk.error,
        Some(ParseError::InvalidChunkLength { declared: 1, .. })
    ));
    assert_eq!(0, r.leaf("c.payload").unwrap().length);
}

#[test]
fn chunk_clamps_at_eof_with_annotation() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: c, type: chunk, length_type: "u16 LE" },
]}}}
"#;
    let result = parse_bytes(text, &hex!("08 00 41 42 43"));
    let r = &result.records[0];
    assert_eq!(5, r.size);
    let payload = r.leaf("c.payload").unwrap();
    assert_eq!(3, payload.length);
    assert!(payload.truncated);
    assert!(payload.error.is_none());
}

#[test]
fn chunk_with_struct_payload() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: c, type: chunk, length_type: u8, payload: { type: struct, fields: [
    { name: a, type: u16 },
    { name: b, type: u8 },
  ]}},
]}}}
"#;
    let result = parse_bytes(text, &hex!("03 01 00 7B"));
    let r = &result.records[0];
    assert_eq!(4, r.size);
    assert_eq!(Some(1), r.leaf("c.payload.a").unwrap().value.as_ref().unwrap().as_u64());
    assert_eq!(Some(0x7B), r.leaf("c.payload.b").unwrap().value.as_ref().unwrap().as_u64());
}

// ---- discriminated records ----

const SWITCHED: &str = r#"
{
  format: record_stream,
  endian: little,
  record: {
    switch: {
      expr: "Header.type_id",
      cases: { "0x0001": TypeA, "0x0002": TypeB },
      default: TypeA,
    },
  },
  types: {
    Header: { fields: [ { name: type_id, type: u16 } ] },
    TypeA: { fields: [ { name: header, type: Header }, { name: value_a, type: u8 } ] },
    TypeB: { fields: [ { name: header, type: Header }, { name: value_b, type: u16 } ] },
  },
}
"#;

#[test]
fn switch_selects_record_types() {
    let result = parse_bytes(SWITCHED, &hex!("01 00 42 02 00 34 12"));
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(2, result.record_count());

    let a = &result.records[0];
    assert_eq!("TypeA", a.type_name);
    assert_eq!(Some("0x0001".to_owned()), a.discriminator);
    assert_eq!(Some(0x42), a.leaf("value_a").unwrap().value.as_ref().unwrap().as_u64());

    let b = &result.records[1];
    assert_eq!("TypeB", b.type_name);
    assert_eq!(3, b.offset);
    assert_eq!(Some(0x1234), b.leaf("value_b").unwrap().value.as_ref().unwrap().as_u64());
}

#[test]
fn unmatched_discriminator_uses_default() {
    let result = parse_bytes(SWITCHED, &hex!("99 00 55"));
    let r = &result.records[0];
    assert_eq!("TypeA", r.type_name);
    assert_eq!(Some("0x0099".to_owned()), r.discriminator);
}

#[test]
fn header_that_does_not_fit_yields_partial_record() {
    let result = parse_bytes(SWITCHED, &hex!("01"));
    // The partial header parse is kept as a record with the error attached.
    assert_eq!(1, result.record_count());
    let r = &result.records[0];
    assert_eq!("Header", r.type_name);
    assert_eq!(0, r.offset);
    assert!(matches!(
        r.error,
        Some(ParseError::DiscriminatorUnresolvable { offset: 0 })
    ));
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::DiscriminatorUnresolvable { .. })));
    // The type_id leaf itself failed at EOF and is surfaced too.
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::FieldOutOfBounds { .. })));
    assert_eq!(2, result.parse_stopped_at);
}

#[test]
fn zero_size_records_are_diagnosed_and_advance() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: items, type: array, length: 0, element: { type: u8 } },
]}}}
"#;
    let result = parse_bytes(text, &hex!("AA BB"));
    // Each record maps nothing; the cursor still walks the whole file one
    // byte at a time instead of spinning.
    assert_eq!(2, result.record_count());
    for (i, r) in result.records.iter().enumerate() {
        assert_eq!(i as u64, r.offset);
        assert_eq!(0, r.size);
        assert!(matches!(r.error, Some(ParseError::EmptyRecord { .. })));
    }
    assert_eq!(2, result.parse_stopped_at);
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::EmptyRecord { .. })));
}

// ---- overlap ----

#[test]
fn overlapping_leaves_are_diagnosed() {
    let text = r#"
{ format: record_stream, types: { R: { fields: [
  { name: a, type: u32, offset: 0 },
  { name: b, type: u16, offset: 2 },
]}}}
"#;
    let result = parse_bytes(text, &hex!("00 00 00 00 00 00"));
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ParseError::Overlap { .. })));
    // Overlap is diagnostic only; records still parse.
    assert!(!result.records.is_empty());
}

// ---- formats ----

#[test]
fn unix_timestamp_formatting() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: stamp, type: u32, format: unix_s },
]}}}
"#;
    // 2009-02-13 23:31:30 UTC
    let result = parse_bytes(text, &1234567890u32.to_le_bytes());
    let stamp = result.records[0].leaf("stamp").unwrap();
    assert_eq!(Some("2009-02-13 23:31:30".to_owned()), stamp.formatted);
}

#[test]
fn dos_date_formatting() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: d, type: u16, format: dos_date },
]}}}
"#;
    // 2004-06-01: (2004-1980)<<9 | 6<<5 | 1 = 0x30C1
    let result = parse_bytes(text, &hex!("C1 30"));
    assert_eq!(
        Some("2004-06-01".to_owned()),
        result.records[0].leaf("d").unwrap().formatted
    );
}

#[test]
fn invalid_dos_date_is_marked() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: d, type: u16, format: dos_date },
]}}}
"#;
    let result = parse_bytes(text, &hex!("00 00"));
    let formatted = result.records[0].leaf("d").unwrap().formatted.clone();
    assert!(formatted.unwrap().starts_with("[invalid:"));
}

#[test]
fn ftm_packed_formatting() {
    let text = r#"
{ format: record_stream, endian: little, types: { R: { fields: [
  { name: t, type: u32, format: ftm_packed },
]}}}
"#;
    // year 2004, month 6, day 1, hour 12, minute 30
    let packed: u32 = (2004 << 20) | (6 << 16) | (1 << 11) | (12 << 6) | 30;
    let result = parse_bytes(text, &packed.to_le_bytes());
    assert_eq!(
        Some("2004-06-01 12:30".to_owned()),
        result.records[0].leaf("t").unwrap().formatted
    );
}
