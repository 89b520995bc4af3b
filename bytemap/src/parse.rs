//! Record parser.
//!
//! Walks a binary file against a validated [`Grammar`], producing an
//! immutable [`ParseResult`]. Field and record failures are attached to the
//! produced nodes and collected into the result's error list; nothing here
//! panics or unwinds on bad input.

use std::{
    path::PathBuf,
    time::SystemTime,
};

use ahash::HashMap;
use log::debug;

use crate::{
    grammar::{
        canonical_key, resolve_endian, root_endian, ChunkSpec, Color, Endian, EndianSource,
        Field, FieldKind, Grammar, GrammarFormat, Length, PrimitiveKind, PrimitiveSpec,
        StrEncoding, TypeDef, Validation, ValueFormat,
    },
    reader::Reader,
};

/// Hard cap on array element counts.
pub const MAX_ARRAY_ITEMS: u64 = 10_000;
/// Hard cap on dynamically sized byte/string fields.
pub const MAX_DYNAMIC_BYTES: u64 = 1_000_000;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{path} at {offset:#x}: field extends past EOF")]
    FieldOutOfBounds { path: String, offset: u64 },
    #[error("{path}: length ref unresolved: {reference}")]
    LengthUnresolved { path: String, reference: String },
    #[error("{path}: length {length} exceeds safety cap {cap}")]
    LengthExceedsCap { path: String, length: u64, cap: u64 },
    #[error("{path}: cannot infer stride")]
    StrideUnknown { path: String },
    #[error("{path}: chunk length {declared} is less than its length field")]
    InvalidChunkLength { path: String, declared: u64 },
    #[error("record at {offset:#x}: cannot resolve discriminator")]
    DiscriminatorUnresolvable { offset: u64 },
    #[error("record at {offset:#x} consumed no bytes")]
    EmptyRecord { offset: u64 },
    #[error("unknown type reference: {name}")]
    MissingType { name: String },
    #[error("grammar declares no types")]
    NoTypes,
    #[error("{path}: validation failed: {detail}")]
    ValidationFailed { path: String, detail: String },
    #[error("failed to read input: {message}")]
    ReadFailed { message: String },
    #[error("Overlap: {first} and {second}")]
    Overlap { first: String, second: String },
}

/// Decoded leaf value; a tagged variant, never a dynamic type.
#[derive(Clone, PartialEq, Debug)]
pub enum ParsedValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
}

impl ParsedValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParsedValue::Int(v) => Some(*v),
            ParsedValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParsedValue::Int(v) => u64::try_from(*v).ok(),
            ParsedValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ParsedValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParsedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Default display rendering: decimal for numbers, hex for bytes, text
    /// verbatim.
    pub fn display(&self) -> String {
        match self {
            ParsedValue::Int(v) => v.to_string(),
            ParsedValue::UInt(v) => v.to_string(),
            ParsedValue::Float(v) => v.to_string(),
            ParsedValue::Bytes(b) => hex::encode(b),
            ParsedValue::Str(s) => s.clone(),
        }
    }
}

/// Shape tag of a parsed node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Primitive(PrimitiveKind),
    Struct,
    Array,
    Chunk,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Primitive(p) => p.into(),
            NodeKind::Struct => "struct",
            NodeKind::Array => "array",
            NodeKind::Chunk => "chunk",
        }
    }
}

/// A parsed leaf, the universal currency between the parser and its
/// consumers. Paths are relative to the enclosing record.
#[derive(Clone, PartialEq, Debug)]
pub struct ParsedField {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub kind: PrimitiveKind,
    pub value: Option<ParsedValue>,
    pub error: Option<ParseError>,
    pub endian: Endian,
    pub endian_source: EndianSource,
    pub format: Option<ValueFormat>,
    /// Display rendering of a format-tagged value.
    pub formatted: Option<String>,
    pub color: Option<Color>,
    /// Set when the field was clamped at EOF; not an error.
    pub truncated: bool,
}

/// Tree shape of one parsed field, internal nodes included.
#[derive(Clone, PartialEq, Debug)]
pub struct ParsedNode {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub kind: NodeKind,
    pub value: Option<ParsedValue>,
    pub error: Option<ParseError>,
    pub children: Vec<ParsedNode>,
    pub endian: Endian,
    pub endian_source: EndianSource,
    pub format: Option<ValueFormat>,
    pub formatted: Option<String>,
    pub color: Option<Color>,
    pub truncated: bool,
}

/// One top-level record.
#[derive(Clone, PartialEq, Debug)]
pub struct ParsedRecord {
    pub type_name: String,
    pub offset: u64,
    pub size: u64,
    /// Canonical discriminator key, when a switch chose the type.
    pub discriminator: Option<String>,
    pub error: Option<ParseError>,
    /// Tree form, one node per declared field.
    pub nodes: Vec<ParsedNode>,
    /// Flat leaves in parse order.
    pub fields: Vec<ParsedField>,
}

impl ParsedRecord {
    /// Leaf by exact record-relative path.
    pub fn leaf(&self, path: &str) -> Option<&ParsedField> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// Whether a node (leaf or internal) exists at the exact path.
    pub fn has_path(&self, path: &str) -> bool {
        fn walk(nodes: &[ParsedNode], path: &str) -> bool {
            nodes
                .iter()
                .any(|n| n.path == path || walk(&n.children, path))
        }
        walk(&self.nodes, path)
    }
}

#[derive(Clone, Debug)]
pub struct ParseResult {
    pub records: Vec<ParsedRecord>,
    pub errors: Vec<ParseError>,
    pub grammar_format: GrammarFormat,
    pub total_bytes_parsed: u64,
    /// Offset the top-level cursor stopped at.
    pub parse_stopped_at: u64,
    pub file_path: PathBuf,
    /// Wall-clock time of the parse; excluded from equality.
    pub timestamp: SystemTime,
}

impl PartialEq for ParseResult {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
            && self.errors == other.errors
            && self.grammar_format == other.grammar_format
            && self.total_bytes_parsed == other.total_bytes_parsed
            && self.parse_stopped_at == other.parse_stopped_at
            && self.file_path == other.file_path
    }
}

impl ParseResult {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ParseOptions {
    pub start_offset: u64,
    /// Bytes after `start_offset` the parse may consume; file size if unset.
    pub byte_limit: Option<u64>,
    /// Safety cap on the record count.
    pub max_records: Option<u64>,
}

/// Parse a file against a grammar. Deterministic: the same inputs produce an
/// equal result (timestamp aside).
pub fn parse_file(grammar: &Grammar, reader: &Reader, options: &ParseOptions) -> ParseResult {
    let file_size = reader.size();
    let start = options.start_offset;
    let end = file_size.min(start.saturating_add(options.byte_limit.unwrap_or(u64::MAX)));

    let mut records: Vec<ParsedRecord> = Vec::new();
    let mut errors: Vec<ParseError> = Vec::new();
    let mut cursor = start;

    while cursor < end {
        if let Some(max) = options.max_records {
            if records.len() as u64 >= max {
                break;
            }
        }
        let mut record = match choose_type(grammar, reader, cursor) {
            Ok((type_def, discriminator)) => {
                let mut builder = RecordBuilder { grammar, reader };
                let mut record = builder.parse_record(type_def, cursor, None);
                record.discriminator = discriminator;
                record
            }
            Err(ChooseTypeError::Fatal(e)) => {
                errors.push(e);
                break;
            }
            // Per-record failure: the partial header parse is kept as a
            // record and the loop moves on.
            Err(ChooseTypeError::Unresolvable(partial)) => *partial,
        };
        if let Some(limit) = options.byte_limit {
            // A record crossing an explicit limit is dropped, not truncated.
            if record.size > start.saturating_add(limit) - cursor {
                break;
            }
        }
        if record.size == 0 && record.error.is_none() {
            record.error = Some(ParseError::EmptyRecord { offset: cursor });
        }
        for node in &record.nodes {
            collect_node_errors(node, &mut errors);
        }
        if let Some(e) = &record.error {
            errors.push(e.clone());
        }
        // Per-record errors never stop the loop; the cursor advances by at
        // least one byte so framing always makes progress.
        cursor += record.size.max(1);
        records.push(record);
    }

    detect_overlaps(&records, &mut errors);
    let total_bytes_parsed = records.iter().map(|r| r.size).sum();
    debug!(
        "parsed {} records, {} bytes, {} errors",
        records.len(),
        total_bytes_parsed,
        errors.len()
    );

    ParseResult {
        records,
        errors,
        grammar_format: grammar.format,
        total_bytes_parsed,
        parse_stopped_at: cursor,
        file_path: reader.path().to_owned(),
        timestamp: SystemTime::now(),
    }
}

fn collect_node_errors(node: &ParsedNode, out: &mut Vec<ParseError>) {
    if let Some(e) = &node.error {
        out.push(e.clone());
    }
    for child in &node.children {
        collect_node_errors(child, out);
    }
}

/// Any pair of intersecting leaves is a grammar bug, reported once per
/// adjacent pair in offset order.
fn detect_overlaps(records: &[ParsedRecord], errors: &mut Vec<ParseError>) {
    let mut spans: Vec<(u64, u64, &str)> = records
        .iter()
        .flat_map(|r| r.fields.iter())
        .filter(|f| f.length > 0)
        .map(|f| (f.offset, f.offset + f.length, f.path.as_str()))
        .collect();
    spans.sort_by_key(|s| (s.0, s.1));
    for pair in spans.windows(2) {
        if pair[1].0 < pair[0].1 {
            errors.push(ParseError::Overlap {
                first: pair[0].2.to_owned(),
                second: pair[1].2.to_owned(),
            });
        }
    }
}

/// How a record-type choice can fail.
enum ChooseTypeError {
    /// Grammar-level misconfiguration; aborts the parse.
    Fatal(ParseError),
    /// The header did not yield a discriminator value. Carries the partial
    /// header parse, which becomes the record.
    Unresolvable(Box<ParsedRecord>),
}

/// Pick the type for the record at `offset`, via the switch when declared.
fn choose_type<'g>(
    grammar: &'g Grammar,
    reader: &Reader,
    offset: u64,
) -> Result<(&'g TypeDef, Option<String>), ChooseTypeError> {
    let Some(switch) = &grammar.switch else {
        return grammar
            .default_type()
            .map(|t| (t, None))
            .ok_or(ChooseTypeError::Fatal(ParseError::NoTypes));
    };
    let header = grammar.get_type(&switch.header_type).ok_or_else(|| {
        ChooseTypeError::Fatal(ParseError::MissingType {
            name: switch.header_type.clone(),
        })
    })?;
    // Partial parse: just enough of the header to read the discriminator.
    let mut builder = RecordBuilder { grammar, reader };
    let mut partial = builder.parse_record(header, offset, Some(&switch.field));
    let value = partial
        .leaf(&switch.field)
        .and_then(|f| f.value.as_ref())
        .and_then(ParsedValue::as_u64);
    let Some(value) = value else {
        partial.error = Some(ParseError::DiscriminatorUnresolvable { offset });
        return Err(ChooseTypeError::Unresolvable(Box::new(partial)));
    };
    let mask = if switch.field_width >= 8 {
        u64::MAX
    } else {
        (1u64 << (switch.field_width * 8)) - 1
    };
    let key = canonical_key(value & mask, switch.field_width);
    let target = switch.case_for(&key);
    let type_def = grammar.get_type(target).ok_or_else(|| {
        ChooseTypeError::Fatal(ParseError::MissingType {
            name: target.to_owned(),
        })
    })?;
    Ok((type_def, Some(key)))
}

/// Already-parsed sibling values; the parent scope is consulted once, after
/// the local one.
struct Scope<'p> {
    values: HashMap<String, i64>,
    parent: Option<&'p Scope<'p>>,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Option<i64> {
        self.values
            .get(name)
            .copied()
            .or_else(|| self.parent.and_then(|p| p.values.get(name).copied()))
    }
}

struct RecordBuilder<'g, 'r> {
    grammar: &'g Grammar,
    reader: &'r Reader,
}

/// Everything a field inherits from its enclosing context.
#[derive(Clone, Copy)]
struct Inherited<'c> {
    endian: (Endian, EndianSource),
    color: Option<&'c Color>,
}

impl RecordBuilder<'_, '_> {
    fn parse_record(
        &mut self,
        type_def: &TypeDef,
        offset: u64,
        partial_until: Option<&str>,
    ) -> ParsedRecord {
        let inherited = Inherited {
            endian: root_endian(self.grammar.endian),
            color: type_def.color.as_ref(),
        };
        let mut leaves = Vec::new();
        let (nodes, size) = self.parse_body(
            &type_def.fields,
            offset,
            "",
            None,
            type_def.endian,
            inherited,
            partial_until,
            &mut leaves,
        );
        ParsedRecord {
            type_name: type_def.name.clone(),
            offset,
            size,
            discriminator: None,
            error: None,
            nodes,
            fields: leaves,
        }
    }

    /// Sequential struct layout: children start at their absolute offset or
    /// at the cursor plus skip; the cursor advances by each child's size.
    #[allow(clippy::too_many_arguments)]
    fn parse_body(
        &mut self,
        fields: &[Field],
        base: u64,
        prefix: &str,
        parent_scope: Option<&Scope>,
        type_endian: Option<Endian>,
        inherited: Inherited,
        partial_until: Option<&str>,
        leaves: &mut Vec<ParsedField>,
    ) -> (Vec<ParsedNode>, u64) {
        let mut scope = Scope {
            values: HashMap::default(),
            parent: parent_scope,
        };
        let mut nodes = Vec::with_capacity(fields.len());
        let mut cursor = base;
        for field in fields {
            let path = join_path(prefix, &field.name);
            let abs = match field.placement {
                crate::grammar::Placement::Next => cursor,
                crate::grammar::Placement::Skip(gap) => cursor.saturating_add(gap),
                crate::grammar::Placement::At(off) => base.saturating_add(off),
            };
            let (node, size) =
                self.parse_field(field, abs, &path, &scope, type_endian, inherited, leaves);
            if let Some(v) = node.value.as_ref().and_then(ParsedValue::as_i64) {
                scope.values.insert(field.name.clone(), v);
            }
            nodes.push(node);
            cursor = abs.saturating_add(size);
            if partial_until == Some(field.name.as_str()) {
                break;
            }
        }
        (nodes, cursor - base)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_field(
        &mut self,
        field: &Field,
        offset: u64,
        path: &str,
        scope: &Scope,
        type_endian: Option<Endian>,
        inherited: Inherited,
        leaves: &mut Vec<ParsedField>,
    ) -> (ParsedNode, u64) {
        let endian = resolve_endian(field.endian, type_endian, inherited.endian);
        let color = field.color.as_ref().or(inherited.color);
        let inherited = Inherited { endian, color };

        match &field.kind {
            FieldKind::Primitive(prim) => {
                self.parse_primitive(field, prim, offset, path, scope, inherited, leaves)
            }
            FieldKind::Struct(children) => {
                let (kids, size) = self.parse_body(
                    children,
                    offset,
                    path,
                    Some(scope),
                    None,
                    inherited,
                    None,
                    leaves,
                );
                let node = ParsedNode {
                    path: path.to_owned(),
                    offset,
                    length: size,
                    kind: NodeKind::Struct,
                    value: None,
                    error: None,
                    children: kids,
                    endian: endian.0,
                    endian_source: endian.1,
                    format: None,
                    formatted: None,
                    color: color.cloned(),
                    truncated: false,
                };
                (node, size)
            }
            FieldKind::Array(spec) => {
                let count = match self.resolve_count(&spec.length, path, scope) {
                    Ok(n) => n,
                    Err(e) => return (error_node(path, offset, NodeKind::Array, e, endian), 0),
                };
                let stride = spec.stride.or_else(|| spec.element.fixed_size());
                let Some(stride) = stride.filter(|s| *s > 0) else {
                    let e = ParseError::StrideUnknown {
                        path: path.to_owned(),
                    };
                    return (error_node(path, offset, NodeKind::Array, e, endian), 0);
                };
                let mut items = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let ipath = format!("{path}[{i}]");
                    let (item, _) = self.parse_field(
                        &spec.element,
                        offset.saturating_add(i.saturating_mul(stride)),
                        &ipath,
                        scope,
                        None,
                        inherited,
                        leaves,
                    );
                    items.push(item);
                }
                let total = count.saturating_mul(stride);
                let node = ParsedNode {
                    path: path.to_owned(),
                    offset,
                    length: total,
                    kind: NodeKind::Array,
                    value: None,
                    error: None,
                    children: items,
                    endian: endian.0,
                    endian_source: endian.1,
                    format: None,
                    formatted: None,
                    color: color.cloned(),
                    truncated: false,
                };
                (node, total)
            }
            FieldKind::Soa(spec) => self.parse_soa(spec, offset, path, scope, inherited, leaves),
            FieldKind::Chunk(spec) => self.parse_chunk(spec, offset, path, scope, inherited, leaves),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_primitive(
        &mut self,
        field: &Field,
        prim: &PrimitiveSpec,
        offset: u64,
        path: &str,
        scope: &Scope,
        inherited: Inherited,
        leaves: &mut Vec<ParsedField>,
    ) -> (ParsedNode, u64) {
        let (endian, endian_source) = inherited.endian;
        let (mut value, mut error, size) = self.read_primitive(prim, offset, endian, path, scope);
        if error.is_none() {
            if let (Some(v), Some(rule)) = (&value, &field.validate) {
                error = validate(v, rule, scope, path);
            }
        }
        if error.is_some() && !matches!(error, Some(ParseError::ValidationFailed { .. })) {
            value = None;
        }
        let formatted = match (&value, field.format) {
            (Some(v), Some(fmt)) => render_format(v, fmt),
            _ => None,
        };
        let leaf = ParsedField {
            path: path.to_owned(),
            offset,
            length: size,
            kind: prim.kind,
            value: value.clone(),
            error: error.clone(),
            endian,
            endian_source,
            format: field.format,
            formatted: formatted.clone(),
            color: inherited.color.cloned(),
            truncated: false,
        };
        leaves.push(leaf);
        let node = ParsedNode {
            path: path.to_owned(),
            offset,
            length: size,
            kind: NodeKind::Primitive(prim.kind),
            value,
            error,
            children: Vec::new(),
            endian,
            endian_source,
            format: field.format,
            formatted,
            color: inherited.color.cloned(),
            truncated: false,
        };
        (node, size)
    }

    /// Read one leaf. Returns `(value, error, consumed)`; the consumed size
    /// is reported even when the read fails so layout can continue.
    fn read_primitive(
        &mut self,
        prim: &PrimitiveSpec,
        offset: u64,
        endian: Endian,
        path: &str,
        scope: &Scope,
    ) -> (Option<ParsedValue>, Option<ParseError>, u64) {
        match prim.kind {
            PrimitiveKind::Bytes => {
                let length = match self.resolve_length(prim.length.as_ref(), path, scope) {
                    Ok(n) => n,
                    Err(e) => return (None, Some(e), 0),
                };
                if offset.saturating_add(length) > self.reader.size() {
                    return (
                        None,
                        Some(ParseError::FieldOutOfBounds {
                            path: path.to_owned(),
                            offset,
                        }),
                        length,
                    );
                }
                let data = match self.reader.read(offset, length) {
                    Ok(d) => d,
                    Err(e) => return (None, Some(read_failed(e)), length),
                };
                let value = match prim.encoding {
                    Some(enc) => ParsedValue::Str(decode_text(&data, enc)),
                    None => ParsedValue::Bytes(data),
                };
                (Some(value), None, length)
            }
            PrimitiveKind::String => {
                let (length, cut_at_nul) = if prim.null_terminated {
                    (prim.max_length.unwrap_or(0), true)
                } else {
                    match self.resolve_length(prim.length.as_ref(), path, scope) {
                        Ok(n) => (n, false),
                        Err(e) => return (None, Some(e), 0),
                    }
                };
                let mut data = match self.reader.read(offset, length) {
                    Ok(d) => d,
                    Err(e) => return (None, Some(read_failed(e)), length),
                };
                if cut_at_nul {
                    if let Some(nul) = memchr::memchr(0, &data) {
                        data.truncate(nul);
                    }
                }
                let enc = prim.encoding.unwrap_or_default();
                (Some(ParsedValue::Str(decode_text(&data, enc))), None, length)
            }
            kind => {
                let width = kind.fixed_size().expect("numeric width");
                let data = match self.reader.read(offset, width) {
                    Ok(d) => d,
                    Err(e) => return (None, Some(read_failed(e)), width),
                };
                if (data.len() as u64) < width {
                    return (
                        None,
                        Some(ParseError::FieldOutOfBounds {
                            path: path.to_owned(),
                            offset,
                        }),
                        width,
                    );
                }
                (Some(decode_numeric(kind, &data, endian)), None, width)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_soa(
        &mut self,
        spec: &crate::grammar::SoaSpec,
        offset: u64,
        path: &str,
        scope: &Scope,
        inherited: Inherited,
        leaves: &mut Vec<ParsedField>,
    ) -> (ParsedNode, u64) {
        let (endian, endian_source) = inherited.endian;
        let count = match self.resolve_count(&spec.length, path, scope) {
            Ok(n) => n,
            Err(e) => return (error_node(path, offset, NodeKind::Array, e, inherited.endian), 0),
        };
        let mut per_row: Vec<Vec<ParsedNode>> = vec![Vec::new(); count as usize];
        let mut cursor = offset;
        for col in &spec.columns {
            let FieldKind::Primitive(prim) = &col.kind else {
                continue;
            };
            let col_size = prim.fixed_size().unwrap_or(0);
            if col_size == 0 {
                let e = ParseError::StrideUnknown {
                    path: format!("{path}.{}", col.name),
                };
                return (error_node(path, offset, NodeKind::Array, e, inherited.endian), 0);
            }
            let col_endian = resolve_endian(col.endian, None, inherited.endian);
            for i in 0..count {
                let leaf_offset = cursor.saturating_add(i.saturating_mul(col_size));
                let leaf_path = format!("{path}[{i}].{}", col.name);
                let (value, error, used) =
                    self.read_primitive(prim, leaf_offset, col_endian.0, &leaf_path, scope);
                let leaf = ParsedField {
                    path: leaf_path.clone(),
                    offset: leaf_offset,
                    length: used,
                    kind: prim.kind,
                    value: value.clone(),
                    error: error.clone(),
                    endian: col_endian.0,
                    endian_source: col_endian.1,
                    format: col.format,
                    formatted: None,
                    color: col.color.as_ref().or(inherited.color).cloned(),
                    truncated: false,
                };
                leaves.push(leaf);
                per_row[i as usize].push(ParsedNode {
                    path: leaf_path,
                    offset: leaf_offset,
                    length: used,
                    kind: NodeKind::Primitive(prim.kind),
                    value,
                    error,
                    children: Vec::new(),
                    endian: col_endian.0,
                    endian_source: col_endian.1,
                    format: col.format,
                    formatted: None,
                    color: col.color.as_ref().or(inherited.color).cloned(),
                    truncated: false,
                });
            }
            cursor = cursor.saturating_add(count.saturating_mul(col_size));
        }
        let total = cursor - offset;
        // Rows are synthesized from the columns: row i gathers the i-th
        // element of every column.
        let rows = per_row
            .into_iter()
            .enumerate()
            .map(|(i, children)| {
                let row_offset = children.iter().map(|c| c.offset).min().unwrap_or(offset);
                let row_len = children.iter().map(|c| c.length).sum();
                ParsedNode {
                    path: format!("{path}[{i}]"),
                    offset: row_offset,
                    length: row_len,
                    kind: NodeKind::Struct,
                    value: None,
                    error: None,
                    children,
                    endian,
                    endian_source,
                    format: None,
                    formatted: None,
                    color: inherited.color.cloned(),
                    truncated: false,
                }
            })
            .collect();
        let node = ParsedNode {
            path: path.to_owned(),
            offset,
            length: total,
            kind: NodeKind::Array,
            value: None,
            error: None,
            children: rows,
            endian,
            endian_source,
            format: None,
            formatted: None,
            color: inherited.color.cloned(),
            truncated: false,
        };
        (node, total)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_chunk(
        &mut self,
        spec: &ChunkSpec,
        offset: u64,
        path: &str,
        scope: &Scope,
        inherited: Inherited,
        leaves: &mut Vec<ParsedField>,
    ) -> (ParsedNode, u64) {
        let (endian, endian_source) = inherited.endian;
        let len_size = spec.length_type.size();
        let len_endian = spec.length_type.endian();
        let len_path = format!("{path}.length");
        let len_data = self.reader.read(offset, len_size).unwrap_or_default();
        if (len_data.len() as u64) < len_size {
            let e = ParseError::FieldOutOfBounds {
                path: len_path,
                offset,
            };
            return (error_node(path, offset, NodeKind::Chunk, e, inherited.endian), 0);
        }
        let declared = uint_from_bytes(&len_data, len_endian);

        let mut chunk_error = None;
        let payload_len = if spec.length_includes_header {
            if declared < len_size {
                chunk_error = Some(ParseError::InvalidChunkLength {
                    path: path.to_owned(),
                    declared,
                });
            }
            declared.saturating_sub(len_size)
        } else {
            declared
        };
        let payload_start = offset + len_size;
        let file_size = self.reader.size();
        let (payload_len, truncated) = if payload_start.saturating_add(payload_len) > file_size {
            (file_size.saturating_sub(payload_start), true)
        } else {
            (payload_len, false)
        };

        // The length field's byte order is declared at the field site.
        let len_node = ParsedNode {
            path: format!("{path}.length"),
            offset,
            length: len_size,
            kind: NodeKind::Primitive(spec.length_type.primitive()),
            value: Some(ParsedValue::UInt(declared)),
            error: None,
            children: Vec::new(),
            endian: len_endian,
            endian_source: EndianSource::Field,
            format: None,
            formatted: None,
            color: inherited.color.cloned(),
            truncated: false,
        };
        leaves.push(ParsedField {
            path: len_node.path.clone(),
            offset,
            length: len_size,
            kind: spec.length_type.primitive(),
            value: len_node.value.clone(),
            error: None,
            endian: len_endian,
            endian_source: EndianSource::Field,
            format: None,
            formatted: None,
            color: inherited.color.cloned(),
            truncated: false,
        });

        let payload_path = format!("{path}.payload");
        let mut payload_node = match &spec.payload.kind {
            FieldKind::Primitive(p) if p.kind == PrimitiveKind::Bytes && p.length.is_none() => {
                let data = self
                    .reader
                    .read(payload_start, payload_len)
                    .unwrap_or_default();
                let value = match p.encoding {
                    Some(enc) => ParsedValue::Str(decode_text(&data, enc)),
                    None => ParsedValue::Bytes(data),
                };
                let node = ParsedNode {
                    path: payload_path.clone(),
                    offset: payload_start,
                    length: payload_len,
                    kind: NodeKind::Primitive(PrimitiveKind::Bytes),
                    value: Some(value),
                    error: None,
                    children: Vec::new(),
                    endian,
                    endian_source,
                    format: None,
                    formatted: None,
                    color: inherited.color.cloned(),
                    truncated: false,
                };
                leaves.push(ParsedField {
                    path: payload_path,
                    offset: payload_start,
                    length: payload_len,
                    kind: PrimitiveKind::Bytes,
                    value: node.value.clone(),
                    error: None,
                    endian,
                    endian_source,
                    format: None,
                    formatted: None,
                    color: inherited.color.cloned(),
                    truncated: false,
                });
                node
            }
            _ => {
                let (node, _) = self.parse_field(
                    &spec.payload,
                    payload_start,
                    &payload_path,
                    scope,
                    None,
                    inherited,
                    leaves,
                );
                node
            }
        };
        if truncated {
            payload_node.truncated = true;
            if let Some(last) = leaves.iter_mut().rev().find(|l| l.path == payload_node.path) {
                last.truncated = true;
            }
        }

        let total = len_size + payload_len;
        let node = ParsedNode {
            path: path.to_owned(),
            offset,
            length: total,
            kind: NodeKind::Chunk,
            value: None,
            error: chunk_error,
            children: vec![len_node, payload_node],
            endian,
            endian_source,
            format: None,
            formatted: None,
            color: inherited.color.cloned(),
            truncated: false,
        };
        (node, total)
    }

    /// Resolve a byte count, applying the dynamic-length safety cap to
    /// reference and expression forms.
    fn resolve_length(
        &self,
        length: Option<&Length>,
        path: &str,
        scope: &Scope,
    ) -> Result<u64, ParseError> {
        let Some(length) = length else {
            return Err(ParseError::LengthUnresolved {
                path: path.to_owned(),
                reference: "<missing length>".to_owned(),
            });
        };
        let (value, dynamic) = match length {
            Length::Fixed(n) => return Ok(*n),
            Length::Ref(name) => (
                scope
                    .lookup(name)
                    .ok_or_else(|| ParseError::LengthUnresolved {
                        path: path.to_owned(),
                        reference: name.clone(),
                    })?,
                true,
            ),
            Length::Expr(e) => (
                e.eval(|name| scope.lookup(name))
                    .map_err(|err| ParseError::LengthUnresolved {
                        path: path.to_owned(),
                        reference: err.to_string(),
                    })?,
                true,
            ),
        };
        let value = u64::try_from(value).map_err(|_| ParseError::LengthUnresolved {
            path: path.to_owned(),
            reference: format!("negative length {value}"),
        })?;
        if dynamic && value > MAX_DYNAMIC_BYTES {
            return Err(ParseError::LengthExceedsCap {
                path: path.to_owned(),
                length: value,
                cap: MAX_DYNAMIC_BYTES,
            });
        }
        Ok(value)
    }

    /// Resolve an element count against the array cap.
    fn resolve_count(
        &self,
        length: &Length,
        path: &str,
        scope: &Scope,
    ) -> Result<u64, ParseError> {
        let value = match length {
            Length::Fixed(n) => *n,
            Length::Ref(name) => {
                let v = scope
                    .lookup(name)
                    .ok_or_else(|| ParseError::LengthUnresolved {
                        path: path.to_owned(),
                        reference: name.clone(),
                    })?;
                u64::try_from(v).map_err(|_| ParseError::LengthUnresolved {
                    path: path.to_owned(),
                    reference: format!("negative length {v}"),
                })?
            }
            Length::Expr(e) => {
                let v = e
                    .eval(|name| scope.lookup(name))
                    .map_err(|err| ParseError::LengthUnresolved {
                        path: path.to_owned(),
                        reference: err.to_string(),
                    })?;
                u64::try_from(v).map_err(|_| ParseError::LengthUnresolved {
                    path: path.to_owned(),
                    reference: format!("negative length {v}"),
                })?
            }
        };
        if value > MAX_ARRAY_ITEMS {
            return Err(ParseError::LengthExceedsCap {
                path: path.to_owned(),
                length: value,
                cap: MAX_ARRAY_ITEMS,
            });
        }
        Ok(value)
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn read_failed(e: crate::reader::ReaderError) -> ParseError {
    ParseError::ReadFailed {
        message: e.to_string(),
    }
}

fn error_node(
    path: &str,
    offset: u64,
    kind: NodeKind,
    error: ParseError,
    endian: (Endian, EndianSource),
) -> ParsedNode {
    ParsedNode {
        path: path.to_owned(),
        offset,
        length: 0,
        kind,
        value: None,
        error: Some(error),
        children: Vec::new(),
        endian: endian.0,
        endian_source: endian.1,
        format: None,
        formatted: None,
        color: None,
        truncated: false,
    }
}

pub(crate) fn uint_from_bytes(data: &[u8], endian: Endian) -> u64 {
    let mut v = 0u64;
    match endian {
        Endian::Little => {
            for &b in data.iter().rev() {
                v = (v << 8) | b as u64;
            }
        }
        Endian::Big => {
            for &b in data {
                v = (v << 8) | b as u64;
            }
        }
    }
    v
}

fn decode_numeric(kind: PrimitiveKind, data: &[u8], endian: Endian) -> ParsedValue {
    let width = kind.fixed_size().expect("numeric width") as usize;
    let raw = uint_from_bytes(&data[..width], endian);
    match kind {
        PrimitiveKind::F32 => ParsedValue::Float(f32::from_bits(raw as u32) as f64),
        PrimitiveKind::F64 => ParsedValue::Float(f64::from_bits(raw)),
        k if k.is_signed() => {
            let shift = 64 - width * 8;
            ParsedValue::Int(((raw << shift) as i64) >> shift)
        }
        _ => ParsedValue::UInt(raw),
    }
}

/// Decode text with replacement, never failing, so alignment is preserved.
pub(crate) fn decode_text(data: &[u8], encoding: StrEncoding) -> String {
    match encoding {
        StrEncoding::Ascii => data
            .iter()
            .map(|&b| if b < 0x80 { b as char } else { '\u{FFFD}' })
            .collect(),
        StrEncoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
        StrEncoding::Utf16Le => encoding_rs::UTF_16LE.decode(data).0.into_owned(),
        StrEncoding::Utf16Be => encoding_rs::UTF_16BE.decode(data).0.into_owned(),
    }
}

fn validate(
    value: &ParsedValue,
    rule: &Validation,
    scope: &Scope,
    path: &str,
) -> Option<ParseError> {
    let ok = match rule {
        Validation::Equals(expected) => value.as_i64() == Some(*expected),
        Validation::EqualsField(name) => match scope.lookup(name) {
            Some(expected) => value.as_i64() == Some(expected),
            None => false,
        },
        Validation::AllBytes(b) => value
            .as_bytes()
            .is_some_and(|data| data.iter().all(|x| x == b)),
    };
    if ok {
        return None;
    }
    let detail = match rule {
        Validation::Equals(expected) => format!("expected {expected}"),
        Validation::EqualsField(name) => format!("expected value of field '{name}'"),
        Validation::AllBytes(b) => format!("expected all bytes {b:#04x}"),
    };
    Some(ParseError::ValidationFailed {
        path: path.to_owned(),
        detail,
    })
}

/// Render a format-tagged value for display. Unrepresentable inputs yield an
/// `[invalid: ...]` marker or nothing; never an error.
fn render_format(value: &ParsedValue, fmt: ValueFormat) -> Option<String> {
    use chrono::{DateTime, Utc};
    match fmt {
        ValueFormat::UnixSeconds => {
            let secs = value.as_i64()?;
            DateTime::<Utc>::from_timestamp(secs, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        ValueFormat::UnixMillis => {
            let ms = value.as_i64()?;
            DateTime::<Utc>::from_timestamp_millis(ms)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        }
        ValueFormat::Filetime => {
            // 100 ns ticks since 1601-01-01.
            let ticks = value.as_i64()?;
            let unix_secs = ticks / 10_000_000 - 11_644_473_600;
            DateTime::<Utc>::from_timestamp(unix_secs, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        ValueFormat::DosDate => {
            let v = value.as_u64()?;
            let day = v & 0x1F;
            let month = (v >> 5) & 0x0F;
            let year = 1980 + ((v >> 9) & 0x7F);
            if month == 0 || month > 12 || day == 0 || day > 31 {
                return Some(format!("[invalid: {v:#06X}]"));
            }
            Some(format!("{year:04}-{month:02}-{day:02}"))
        }
        ValueFormat::DosDatetime => {
            let data = value.as_bytes()?;
            if data.len() < 4 {
                return None;
            }
            let time_val = u16::from_le_bytes([data[0], data[1]]) as u64;
            let date_val = u16::from_le_bytes([data[2], data[3]]) as u64;
            let sec = (time_val & 0x1F) * 2;
            let minute = (time_val >> 5) & 0x3F;
            let hour = (time_val >> 11) & 0x1F;
            let day = date_val & 0x1F;
            let month = (date_val >> 5) & 0x0F;
            let year = 1980 + ((date_val >> 9) & 0x7F);
            if month == 0 || month > 12 || day == 0 || day > 31 {
                return Some(format!("[invalid date: {date_val:#06X}]"));
            }
            Some(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{sec:02}"
            ))
        }
        ValueFormat::FtmPacked => {
            let v = match value {
                ParsedValue::Bytes(data) if data.len() >= 4 => {
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64
                }
                ParsedValue::Bytes(_) => return None,
                other => other.as_u64()?,
            };
            let year = (v >> 20) & 0xFFF;
            let month = (v >> 16) & 0x0F;
            let day = (v >> 11) & 0x1F;
            let hour = (v >> 6) & 0x1F;
            let minute = v & 0x3F;
            if year == 0 || month == 0 || month > 12 || day == 0 || day > 31 {
                return Some(format!("[invalid: {v:#010X}]"));
            }
            Some(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}"
            ))
        }
    }
}

#[cfg(test)]
mod tests;
