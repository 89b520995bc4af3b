//! Grammar document syntax.
//!
//! A grammar document is a single brace-delimited mapping in a JSON-like
//! notation: bare words read as strings, `0x` integer literals are accepted,
//! `#` starts a line comment, and a trailing comma is allowed. The linter
//! consumes the [`Value`] tree produced here; [`render`] writes the canonical
//! text form back out.

use std::fmt::Write as _;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    character::complete::{anychar, char, hex_digit1, satisfy},
    combinator::{all_consuming, map, opt, recognize, value},
    error::{ErrorKind, FromExternalError, ParseError as NomParseError},
    multi::{many0_count, separated_list0},
    number::complete::recognize_float,
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult, Parser,
};

// Set `nom::error::VerboseError<&'a str>` for detail error
#[cfg(not(debug_assertions))]
type ParseError<'a> = nom::error::Error<&'a str>;
#[cfg(debug_assertions)]
type ParseError<'a> = nom::error::VerboseError<&'a str>;
type ParseResult<'a, O, E = ParseError<'a>> = IResult<&'a str, O, E>;

/// Document could not be read as a value tree.
#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("syntax error at line {line}, column {column}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
}

impl SyntaxError {
    fn at(document: &str, rest: &str) -> Self {
        let consumed = &document[..document.len() - rest.len()];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed
            .chars()
            .rev()
            .take_while(|&c| c != '\n')
            .count()
            + 1;
        Self { line, column }
    }
}

/// Ordered mapping; duplicate keys are preserved so the linter can report
/// them with a path.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Map(Vec<(String, Value)>);

impl Map {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys that appear more than once, first occurrence order.
    pub fn duplicate_keys(&self) -> Vec<&str> {
        let mut seen = ahash::HashSet::default();
        let mut dups = Vec::new();
        for (k, _) in &self.0 {
            if !seen.insert(k.as_str()) && !dups.contains(&k.as_str()) {
                dups.push(k.as_str());
            }
        }
        dups
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Array(Vec<Value>),
    Map(Map),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Human name of the variant, for lint messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "mapping",
        }
    }
}

/// Parse a whole document: one mapping, nothing but whitespace and comments
/// around it.
pub fn parse_document(document: &str) -> Result<Value, SyntaxError> {
    match all_consuming(ws(parse_map))(document) {
        Ok((_, m)) => Ok(Value::Map(m)),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(SyntaxError::at(document, error_input(&e)))
        }
        Err(nom::Err::Incomplete(_)) => unreachable!(),
    }
}

#[cfg(debug_assertions)]
fn error_input<'a>(e: &ParseError<'a>) -> &'a str {
    e.errors.first().map_or("", |(i, _)| i)
}

#[cfg(not(debug_assertions))]
fn error_input<'a>(e: &ParseError<'a>) -> &'a str {
    e.input
}

fn comment(input: &str) -> ParseResult<'_, ()> {
    value((), pair(char('#'), opt(is_not("\n\r"))))(input)
}

fn whitespace_or_comment(input: &str) -> ParseResult<'_, ()> {
    value(
        (),
        many0_count(alt((
            value((), take_while1(|c: char| c.is_ascii_whitespace())),
            comment,
        ))),
    )(input)
}

/// A combinator that takes a parser `inner` and produces a parser that also
/// consumes both leading and trailing whitespace, returning the output of
/// `inner`.
fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: Parser<&'a str, O, ParseError<'a>>,
{
    delimited(whitespace_or_comment, inner, whitespace_or_comment)
}

fn bare_word(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn string_literal(input: &str) -> ParseResult<'_, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => {
                return Err(nom::Err::Failure(ParseError::from_error_kind(
                    rest,
                    ErrorKind::Char,
                )))
            }
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => {
                let after = chars.as_str();
                let (after, c) = escape_char(after)?;
                out.push(c);
                rest = after;
            }
            Some(c) => {
                out.push(c);
                rest = chars.as_str();
            }
        }
    }
}

fn escape_char(input: &str) -> ParseResult<'_, char> {
    let (rest, c) = anychar(input)?;
    match c {
        '"' => Ok((rest, '"')),
        '\\' => Ok((rest, '\\')),
        'n' => Ok((rest, '\n')),
        'r' => Ok((rest, '\r')),
        't' => Ok((rest, '\t')),
        'x' => {
            let (rest, hex) = recognize(pair(
                satisfy(|c| c.is_ascii_hexdigit()),
                satisfy(|c| c.is_ascii_hexdigit()),
            ))(rest)?;
            let byte = u8::from_str_radix(hex, 16).map_err(|e| {
                nom::Err::Failure(ParseError::from_external_error(rest, ErrorKind::HexDigit, e))
            })?;
            Ok((rest, byte as char))
        }
        _ => Err(nom::Err::Failure(ParseError::from_error_kind(
            input,
            ErrorKind::Escaped,
        ))),
    }
}

fn hex_integer(input: &str) -> ParseResult<'_, Value> {
    let (rest, digits) = preceded(tag("0x"), hex_digit1)(input)?;
    let n = i64::from_str_radix(digits, 16).map_err(|e| {
        nom::Err::Failure(ParseError::from_external_error(rest, ErrorKind::HexDigit, e))
    })?;
    Ok((rest, Value::Integer(n)))
}

fn number(input: &str) -> ParseResult<'_, Value> {
    let (rest, text) = recognize_float(input)?;
    let v = if text.contains('.') || text.contains(['e', 'E']) {
        text.parse::<f64>().ok().map(Value::Number)
    } else {
        text.parse::<i64>().ok().map(Value::Integer)
    };
    v.map(|v| (rest, v)).ok_or_else(|| {
        nom::Err::Failure(ParseError::from_error_kind(input, ErrorKind::Digit))
    })
}

fn parse_value(input: &str) -> ParseResult<'_, Value> {
    alt((
        map(string_literal, Value::Text),
        map(parse_map, Value::Map),
        map(parse_array, Value::Array),
        hex_integer,
        number,
        map(bare_word, |w| match w {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Text(w.to_owned()),
        }),
    ))(input)
}

fn parse_array(input: &str) -> ParseResult<'_, Vec<Value>> {
    delimited(
        char('['),
        terminated(
            separated_list0(char(','), ws(parse_value)),
            opt(ws(char(','))),
        ),
        char(']'),
    )(input)
}

fn map_key(input: &str) -> ParseResult<'_, String> {
    alt((string_literal, map(bare_word, str::to_owned)))(input)
}

fn map_entry(input: &str) -> ParseResult<'_, (String, Value)> {
    separated_pair(map_key, ws(char(':')), parse_value)(input)
}

fn parse_map(input: &str) -> ParseResult<'_, Map> {
    map(
        delimited(
            char('{'),
            terminated(
                separated_list0(char(','), ws(map_entry)),
                opt(ws(char(','))),
            ),
            char('}'),
        ),
        Map::from_iter,
    )(input)
}

/// Render a value tree in the canonical text form. Re-parsing the output
/// yields an equal tree.
pub fn render(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, 0);
    out.push('\n');
    out
}

fn is_bare(s: &str) -> bool {
    !s.is_empty()
        && !matches!(s, "null" | "true" | "false")
        && s.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_text(out: &mut String, s: &str) {
    if is_bare(s) {
        out.push_str(s);
        return;
    }
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_value(out: &mut String, v: &Value, depth: usize) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Number(f) => {
            let _ = write!(out, "{f:?}");
        }
        Value::Text(s) => write_text(out, s),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[\n");
            for item in items {
                write_indent(out, depth + 1);
                write_value(out, item, depth + 1);
                out.push_str(",\n");
            }
            write_indent(out, depth);
            out.push(']');
        }
        Value::Map(m) => {
            if m.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (k, v) in m.iter() {
                write_indent(out, depth + 1);
                write_text(out, k);
                out.push_str(": ");
                write_value(out, v, depth + 1);
                out.push_str(",\n");
            }
            write_indent(out, depth);
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests;
