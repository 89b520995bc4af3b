use super::*;
use test_case::test_case;

fn parse(text: &str) -> Value {
    parse_document(text).unwrap()
}

fn top(text: &str, key: &str) -> Value {
    parse(text).as_map().unwrap().get(key).unwrap().clone()
}

#[test_case("{a: null}", Value::Null; "null")]
#[test_case("{a: true}", Value::Bool(true); "bool_true")]
#[test_case("{a: false}", Value::Bool(false); "bool_false")]
#[test_case("{a: 42}", Value::Integer(42); "decimal int")]
#[test_case("{a: -7}", Value::Integer(-7); "negative int")]
#[test_case("{a: 0x4E54}", Value::Integer(0x4E54); "hex int")]
#[test_case("{a: 1.5}", Value::Number(1.5); "float")]
#[test_case("{a: word}", Value::Text("word".to_owned()); "bare word")]
#[test_case("{a: \"two words\"}", Value::Text("two words".to_owned()); "quoted string")]
#[test_case("{a: \"x\\n\\t\\\"\\\\\"}", Value::Text("x\n\t\"\\".to_owned()); "escapes")]
#[test_case("{a: \"\\x41\"}", Value::Text("A".to_owned()); "hex escape")]
#[test_case("{a: []}", Value::Array(vec![]); "empty array")]
#[test_case("{a: [1, 2,]}", Value::Array(vec![Value::Integer(1), Value::Integer(2)]); "trailing comma array")]
#[test_case("{a: {}}", Value::Map(Map::default()); "empty map")]
fn scalar_values(text: &str, expected: Value) {
    assert_eq!(expected, top(text, "a"));
}

#[test]
fn map_preserves_declaration_order() {
    let v = parse("{z: 1, a: 2, m: 3}");
    let keys: Vec<_> = v.as_map().unwrap().keys().collect();
    assert_eq!(vec!["z", "a", "m"], keys);
}

#[test]
fn comments_and_whitespace() {
    let text = "
# leading comment
{
  a: 1,  # trailing comment
  # a whole line
  b: [2, 3],
}
";
    let v = parse(text);
    let m = v.as_map().unwrap();
    assert_eq!(Some(1), m.get("a").unwrap().as_int());
    assert_eq!(2, m.get("b").unwrap().as_array().unwrap().len());
}

#[test]
fn quoted_keys() {
    let v = parse("{\"0x4E54\": name}");
    assert!(v.as_map().unwrap().contains_key("0x4E54"));
}

#[test]
fn nested_structure() {
    let v = parse("{types: {Record: {fields: [{name: a, type: u8}]}}}");
    let fields = v
        .as_map()
        .unwrap()
        .get("types")
        .unwrap()
        .as_map()
        .unwrap()
        .get("Record")
        .unwrap()
        .as_map()
        .unwrap()
        .get("fields")
        .unwrap()
        .as_array()
        .unwrap();
    assert_eq!(1, fields.len());
    assert_eq!(
        Some("u8"),
        fields[0].as_map().unwrap().get("type").unwrap().as_str()
    );
}

#[test_case(""; "empty input")]
#[test_case("[1, 2]"; "top level array")]
#[test_case("{a: 1"; "unclosed map")]
#[test_case("{a 1}"; "missing colon")]
#[test_case("{a: \"unterminated}"; "unterminated string")]
#[test_case("{a: 1} trailing"; "trailing garbage")]
fn syntax_errors(text: &str) {
    assert!(parse_document(text).is_err());
}

#[test]
fn syntax_error_carries_position() {
    let err = parse_document("{a: 1,\n  b %}").unwrap_err();
    assert_eq!(2, err.line);
}

#[test]
fn duplicate_keys_are_preserved_and_reported() {
    let v = parse("{a: 1, b: 2, a: 3}");
    let m = v.as_map().unwrap();
    assert_eq!(vec!["a"], m.duplicate_keys());
    // First occurrence wins on lookup.
    assert_eq!(Some(1), m.get("a").unwrap().as_int());
}

#[test_case(Value::Null; "null")]
#[test_case(Value::Bool(true); "bool")]
#[test_case(Value::Integer(-12); "int")]
#[test_case(Value::Number(2.5); "float")]
#[test_case(Value::Text("bare_word".to_owned()); "bare text")]
#[test_case(Value::Text("needs quoting".to_owned()); "quoted text")]
#[test_case(Value::Text("esc\"\\\n".to_owned()); "escaped text")]
#[test_case(Value::Array(vec![Value::Integer(1), Value::Text("x".to_owned())]); "array")]
fn render_round_trips(v: Value) {
    let doc = Value::Map(Map::from_iter([("k".to_owned(), v)]));
    let text = render(&doc);
    assert_eq!(doc, parse(&text));
}

#[test]
fn render_round_trips_nested_document() {
    let text = "{format: record_stream, types: {R: {fields: [{name: a, type: u16, length: \"a - 4\"}]}}}";
    let v = parse(text);
    assert_eq!(v, parse(&render(&v)));
}
