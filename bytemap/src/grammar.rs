//! Validated grammar model.
//!
//! A [`Grammar`] is produced by the linter and never mutated afterwards; the
//! parser, span generator and decoders all read from it. Collections keep the
//! declaration order of the source document.

use std::fmt::Write as _;

use crate::{
    document::{Map, Value},
    expr::Expr,
};

/// Byte order of a multi-byte numeric field.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Default,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Where a resolved endianness came from, reported alongside the value so
/// consumers can show it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum EndianSource {
    Field,
    Type,
    Parent,
    Root,
    Default,
}

/// Resolve effective endianness: field override, then type, then whatever the
/// enclosing context resolved to. An inherited value that was explicitly set
/// somewhere up the chain reports `parent`; an inherited root default keeps
/// reporting `root` (or `default`) all the way down.
pub fn resolve_endian(
    field: Option<Endian>,
    ty: Option<Endian>,
    inherited: (Endian, EndianSource),
) -> (Endian, EndianSource) {
    if let Some(e) = field {
        return (e, EndianSource::Field);
    }
    if let Some(e) = ty {
        return (e, EndianSource::Type);
    }
    match inherited.1 {
        EndianSource::Root | EndianSource::Default => inherited,
        _ => (inherited.0, EndianSource::Parent),
    }
}

/// The endianness context at the grammar root.
pub fn root_endian(grammar_default: Option<Endian>) -> (Endian, EndianSource) {
    match grammar_default {
        Some(e) => (e, EndianSource::Root),
        None => (Endian::Little, EndianSource::Default),
    }
}

/// Closed set of leaf value types.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum PrimitiveKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bytes,
    String,
}

impl PrimitiveKind {
    /// Size in bytes for numeric kinds; `None` for `bytes` and `string`.
    pub fn fixed_size(self) -> Option<u64> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::Bytes | Self::String => None,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Self::F32 | Self::F64 | Self::Bytes | Self::String)
    }

    pub fn group(self) -> SpanGroup {
        match self {
            Self::F32 | Self::F64 => SpanGroup::Float,
            Self::Bytes => SpanGroup::Bytes,
            Self::String => SpanGroup::String,
            _ => SpanGroup::Int,
        }
    }
}

/// Styling group a primitive collapses to.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum SpanGroup {
    Int,
    Float,
    String,
    Bytes,
}

/// Text encodings accepted for `string` fields.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
pub enum StrEncoding {
    #[default]
    #[strum(serialize = "ascii")]
    Ascii,
    #[strum(serialize = "utf-8")]
    Utf8,
    #[strum(serialize = "utf-16le")]
    Utf16Le,
    #[strum(serialize = "utf-16be")]
    Utf16Be,
}

pub const NAMED_COLORS: [&str; 14] = [
    "black", "white", "gray", "grey", "red", "green", "blue", "yellow", "cyan", "magenta",
    "purple", "orange", "pink", "brown",
];

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("Invalid color '{0}'. Use a named color or hex #RGB/#RRGGBB.")]
pub struct ColorError(pub String);

/// A normalized color: a lowercase name from the closed set, or `#rrggbb`.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Color(String);

impl Color {
    /// Normalize a color spec. `#RGB` expands to `#rrggbb`, hex digits and
    /// names lowercase.
    pub fn parse(s: &str) -> Result<Self, ColorError> {
        let lower = s.trim().to_ascii_lowercase();
        if NAMED_COLORS.contains(&lower.as_str()) {
            return Ok(Self(lower));
        }
        if let Some(digits) = lower.strip_prefix('#') {
            if digits.chars().all(|c| c.is_ascii_hexdigit()) {
                match digits.len() {
                    3 => {
                        let mut out = String::with_capacity(7);
                        out.push('#');
                        for c in digits.chars() {
                            out.push(c);
                            out.push(c);
                        }
                        return Ok(Self(out));
                    }
                    6 => return Ok(Self(lower)),
                    _ => {}
                }
            }
        }
        Err(ColorError(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How a dynamic byte count is obtained.
#[derive(Clone, PartialEq, Debug)]
pub enum Length {
    Fixed(u64),
    /// Bare name of an already-parsed sibling (or immediate-parent sibling).
    Ref(String),
    /// Arithmetic expression over such names.
    Expr(Expr),
}

impl Length {
    /// Names the length depends on, for declaration-order checks.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Length::Fixed(_) => Vec::new(),
            Length::Ref(name) => vec![name.as_str()],
            Length::Expr(e) => e.idents().collect(),
        }
    }
}

/// Field placement within its container.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Placement {
    /// Sequential, right after the previous sibling.
    #[default]
    Next,
    /// Sequential with a gap.
    Skip(u64),
    /// Absolute offset from the container base.
    At(u64),
}

/// Validation predicate attached to a field.
#[derive(Clone, PartialEq, Debug)]
pub enum Validation {
    Equals(i64),
    EqualsField(String),
    AllBytes(u8),
}

/// Display format tag for numeric / packed date fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum ValueFormat {
    #[strum(serialize = "unix_s")]
    UnixSeconds,
    #[strum(serialize = "unix_ms")]
    UnixMillis,
    #[strum(serialize = "filetime")]
    Filetime,
    #[strum(serialize = "dos_date")]
    DosDate,
    #[strum(serialize = "dos_datetime")]
    DosDatetime,
    #[strum(serialize = "ftm_packed")]
    FtmPacked,
}

/// Width and byte order of a chunk's leading length field.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum ChunkLengthType {
    #[strum(serialize = "u8")]
    U8,
    #[strum(serialize = "u16 LE")]
    U16Le,
    #[strum(serialize = "u16 BE")]
    U16Be,
    #[strum(serialize = "u32 LE")]
    U32Le,
    #[strum(serialize = "u32 BE")]
    U32Be,
}

impl ChunkLengthType {
    pub fn size(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16Le | Self::U16Be => 2,
            Self::U32Le | Self::U32Be => 4,
        }
    }

    pub fn endian(self) -> Endian {
        match self {
            Self::U16Be | Self::U32Be => Endian::Big,
            _ => Endian::Little,
        }
    }

    pub fn primitive(self) -> PrimitiveKind {
        match self {
            Self::U8 => PrimitiveKind::U8,
            Self::U16Le | Self::U16Be => PrimitiveKind::U16,
            Self::U32Le | Self::U32Be => PrimitiveKind::U32,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct PrimitiveSpec {
    pub kind: PrimitiveKind,
    /// `bytes` / `string` byte count. `None` for numerics, null-terminated
    /// strings, and chunk payloads whose chunk supplies the length.
    pub length: Option<Length>,
    /// Always set for `string`; set on `bytes` only when the document asks
    /// for text decoding.
    pub encoding: Option<StrEncoding>,
    pub null_terminated: bool,
    pub max_length: Option<u64>,
}

impl PrimitiveSpec {
    pub fn numeric(kind: PrimitiveKind) -> Self {
        Self {
            kind,
            length: None,
            encoding: None,
            null_terminated: false,
            max_length: None,
        }
    }

    /// Statically known size, when there is one.
    pub fn fixed_size(&self) -> Option<u64> {
        if let Some(sz) = self.kind.fixed_size() {
            return Some(sz);
        }
        if self.null_terminated {
            return self.max_length;
        }
        match self.length {
            Some(Length::Fixed(n)) => Some(n),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ArraySpec {
    pub length: Length,
    pub element: Box<Field>,
    pub stride: Option<u64>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct SoaSpec {
    pub length: Length,
    /// Fixed-size primitive columns, one per record field.
    pub columns: Vec<Field>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ChunkSpec {
    pub length_type: ChunkLengthType,
    pub length_includes_header: bool,
    pub payload: Box<Field>,
}

/// Closed set of field shapes; the parser dispatches on the tag.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldKind {
    Primitive(PrimitiveSpec),
    Struct(Vec<Field>),
    Array(ArraySpec),
    Soa(SoaSpec),
    Chunk(ChunkSpec),
}

/// One declared element of a type body.
#[derive(Clone, PartialEq, Debug)]
pub struct Field {
    pub name: String,
    pub placement: Placement,
    pub endian: Option<Endian>,
    pub color: Option<Color>,
    pub validate: Option<Validation>,
    pub format: Option<ValueFormat>,
    pub kind: FieldKind,
}

impl Field {
    /// Statically known size, used for array stride inference. Sequential
    /// struct layout is simulated; anything dynamic returns `None`.
    pub fn fixed_size(&self) -> Option<u64> {
        match &self.kind {
            FieldKind::Primitive(p) => p.fixed_size(),
            FieldKind::Struct(fields) => {
                let mut cursor = 0u64;
                for f in fields {
                    let sz = f.fixed_size()?;
                    let start = match f.placement {
                        Placement::Next => cursor,
                        Placement::Skip(gap) => cursor.checked_add(gap)?,
                        Placement::At(off) => off,
                    };
                    cursor = start.checked_add(sz)?;
                }
                Some(cursor)
            }
            FieldKind::Array(a) => {
                let Length::Fixed(n) = a.length else {
                    return None;
                };
                let stride = a.stride.or_else(|| a.element.fixed_size())?;
                n.checked_mul(stride)
            }
            FieldKind::Soa(_) | FieldKind::Chunk(_) => None,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct TypeDef {
    pub name: String,
    pub endian: Option<Endian>,
    pub color: Option<Color>,
    pub fields: Vec<Field>,
}

/// `TypeName.field_name` dispatch for discriminated records.
#[derive(Clone, PartialEq, Debug)]
pub struct RecordSwitch {
    /// Header type parsed to obtain the discriminator.
    pub header_type: String,
    /// Field of the header type whose value selects the record type.
    pub field: String,
    /// Width in bytes of the discriminator field; fixes the canonical key
    /// format.
    pub field_width: u64,
    /// Canonical hex key to type name, declaration order.
    pub cases: Vec<(String, String)>,
    pub default: String,
}

impl RecordSwitch {
    pub fn case_for(&self, key: &str) -> &str {
        self.cases
            .iter()
            .find(|(k, _)| k == key)
            .map_or(self.default.as_str(), |(_, t)| t.as_str())
    }
}

/// Canonical discriminator key: `0x` + uppercase hex, zero-padded to the
/// field width.
pub fn canonical_key(value: u64, width_bytes: u64) -> String {
    let digits = (width_bytes * 2) as usize;
    let mut out = String::with_capacity(2 + digits);
    out.push_str("0x");
    let _ = write!(out, "{value:0digits$X}");
    out
}

/// Payload decoder named by a registry entry.
#[derive(Clone, PartialEq, Debug)]
pub enum Decoder {
    None,
    Str { encoding: StrEncoding },
    U16 { endian: Option<Endian> },
    U32 { endian: Option<Endian> },
    Hex,
    FtmPackedDate,
    Int { width: u8, endian: Option<Endian>, signed: bool },
    Bitflags { width: u8 },
}

impl Decoder {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Decoder::None => "none",
            Decoder::Str { .. } => "string",
            Decoder::U16 { .. } => "u16",
            Decoder::U32 { .. } => "u32",
            Decoder::Hex => "hex",
            Decoder::FtmPackedDate => "ftm_packed_date",
            Decoder::Int { .. } => "int",
            Decoder::Bitflags { .. } => "bitflags",
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct RegistryEntry {
    pub display_name: String,
    pub decoder: Decoder,
    /// Field of the record the decoder applies to; defaults to `payload`.
    pub field: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum GrammarFormat {
    #[default]
    #[strum(serialize = "record_stream")]
    RecordStream,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum Framing {
    #[default]
    #[strum(serialize = "until_eof")]
    UntilEof,
}

/// A validated grammar. Immutable once built.
#[derive(Clone, PartialEq, Debug)]
pub struct Grammar {
    pub format: GrammarFormat,
    pub endian: Option<Endian>,
    pub framing: Framing,
    pub switch: Option<RecordSwitch>,
    pub types: Vec<TypeDef>,
    /// Canonical hex key to registry entry, declaration order.
    pub registry: Vec<(String, RegistryEntry)>,
}

impl Grammar {
    pub fn get_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.name == name)
    }

    /// The type used for every record when no switch is declared: the first
    /// declared type.
    pub fn default_type(&self) -> Option<&TypeDef> {
        self.types.first()
    }

    pub fn registry_entry(&self, key: &str) -> Option<&RegistryEntry> {
        self.registry
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, e)| e)
    }

    /// Canonical document form; re-linting it yields an equal grammar.
    pub fn to_document(&self) -> Value {
        let mut root = vec![(
            "format".to_owned(),
            Value::Text(self.format.to_string()),
        )];
        if let Some(e) = self.endian {
            root.push(("endian".to_owned(), Value::Text(e.to_string())));
        }
        root.push((
            "framing".to_owned(),
            Value::Map(Map::from_iter([(
                "repeat".to_owned(),
                Value::Text(self.framing.to_string()),
            )])),
        ));
        if let Some(switch) = &self.switch {
            let cases = switch
                .cases
                .iter()
                .map(|(k, t)| (k.clone(), Value::Text(t.clone())))
                .collect::<Map>();
            let switch_map = Map::from_iter([
                (
                    "expr".to_owned(),
                    Value::Text(format!("{}.{}", switch.header_type, switch.field)),
                ),
                ("cases".to_owned(), Value::Map(cases)),
                ("default".to_owned(), Value::Text(switch.default.clone())),
            ]);
            root.push((
                "record".to_owned(),
                Value::Map(Map::from_iter([(
                    "switch".to_owned(),
                    Value::Map(switch_map),
                )])),
            ));
        }
        if !self.types.is_empty() {
            let types = self
                .types
                .iter()
                .map(|t| (t.name.clone(), type_to_value(t)))
                .collect::<Map>();
            root.push(("types".to_owned(), Value::Map(types)));
        }
        if !self.registry.is_empty() {
            let registry = self
                .registry
                .iter()
                .map(|(k, e)| (k.clone(), registry_entry_to_value(e)))
                .collect::<Map>();
            root.push(("registry".to_owned(), Value::Map(registry)));
        }
        Value::Map(Map::from_iter(root))
    }
}

fn type_to_value(t: &TypeDef) -> Value {
    let mut m = vec![("type".to_owned(), Value::Text("struct".to_owned()))];
    if let Some(e) = t.endian {
        m.push(("endian".to_owned(), Value::Text(e.to_string())));
    }
    if let Some(c) = &t.color {
        m.push(("color".to_owned(), Value::Text(c.as_str().to_owned())));
    }
    m.push((
        "fields".to_owned(),
        Value::Array(t.fields.iter().map(field_to_value).collect()),
    ));
    Value::Map(Map::from_iter(m))
}

fn length_to_value(l: &Length) -> Value {
    match l {
        Length::Fixed(n) => Value::Integer(*n as i64),
        Length::Ref(name) => Value::Text(name.clone()),
        Length::Expr(e) => Value::Text(e.source().to_owned()),
    }
}

fn field_to_value(f: &Field) -> Value {
    let mut m = vec![("name".to_owned(), Value::Text(f.name.clone()))];
    match f.placement {
        Placement::Next => {}
        Placement::Skip(n) => m.push(("skip".to_owned(), Value::Integer(n as i64))),
        Placement::At(n) => m.push(("offset".to_owned(), Value::Integer(n as i64))),
    }
    match &f.kind {
        FieldKind::Primitive(p) => {
            m.push(("type".to_owned(), Value::Text(p.kind.to_string())));
            if p.null_terminated {
                m.push(("null_terminated".to_owned(), Value::Bool(true)));
                if let Some(n) = p.max_length {
                    m.push(("max_length".to_owned(), Value::Integer(n as i64)));
                }
            } else if let Some(l) = &p.length {
                m.push(("length".to_owned(), length_to_value(l)));
            }
            if let Some(enc) = p.encoding {
                m.push(("encoding".to_owned(), Value::Text(enc.to_string())));
            }
        }
        FieldKind::Struct(fields) => {
            m.push(("type".to_owned(), Value::Text("struct".to_owned())));
            m.push((
                "fields".to_owned(),
                Value::Array(fields.iter().map(field_to_value).collect()),
            ));
        }
        FieldKind::Array(a) => {
            m.push(("type".to_owned(), Value::Text("array".to_owned())));
            m.push(("length".to_owned(), length_to_value(&a.length)));
            if let Some(s) = a.stride {
                m.push(("stride".to_owned(), Value::Integer(s as i64)));
            }
            m.push(("element".to_owned(), field_to_value(&a.element)));
        }
        FieldKind::Soa(s) => {
            m.push(("type".to_owned(), Value::Text("array".to_owned())));
            m.push(("layout".to_owned(), Value::Text("soa".to_owned())));
            m.push(("length".to_owned(), length_to_value(&s.length)));
            m.push((
                "fields".to_owned(),
                Value::Array(s.columns.iter().map(field_to_value).collect()),
            ));
        }
        FieldKind::Chunk(c) => {
            m.push(("type".to_owned(), Value::Text("chunk".to_owned())));
            m.push((
                "length_type".to_owned(),
                Value::Text(c.length_type.to_string()),
            ));
            if c.length_includes_header {
                m.push(("length_includes_header".to_owned(), Value::Bool(true)));
            }
            m.push(("payload".to_owned(), field_to_value(&c.payload)));
        }
    }
    if let Some(e) = f.endian {
        m.push(("endian".to_owned(), Value::Text(e.to_string())));
    }
    if let Some(c) = &f.color {
        m.push(("color".to_owned(), Value::Text(c.as_str().to_owned())));
    }
    if let Some(v) = &f.validate {
        let entry = match v {
            Validation::Equals(n) => ("equals".to_owned(), Value::Integer(*n)),
            Validation::EqualsField(name) => {
                ("equals_field".to_owned(), Value::Text(name.clone()))
            }
            Validation::AllBytes(b) => ("all_bytes".to_owned(), Value::Integer(*b as i64)),
        };
        m.push(("validate".to_owned(), Value::Map(Map::from_iter([entry]))));
    }
    if let Some(fmt) = f.format {
        m.push(("format".to_owned(), Value::Text(fmt.to_string())));
    }
    Value::Map(Map::from_iter(m))
}

fn registry_entry_to_value(e: &RegistryEntry) -> Value {
    let mut decode = vec![(
        "as".to_owned(),
        Value::Text(e.decoder.kind_name().to_owned()),
    )];
    match &e.decoder {
        Decoder::Str { encoding } => {
            decode.push(("encoding".to_owned(), Value::Text(encoding.to_string())));
        }
        Decoder::U16 { endian: Some(en) } | Decoder::U32 { endian: Some(en) } => {
            decode.push(("endian".to_owned(), Value::Text(en.to_string())));
        }
        Decoder::Int { width, endian, signed } => {
            decode.push(("width".to_owned(), Value::Integer(*width as i64)));
            if let Some(en) = endian {
                decode.push(("endian".to_owned(), Value::Text(en.to_string())));
            }
            if *signed {
                decode.push(("signed".to_owned(), Value::Bool(true)));
            }
        }
        Decoder::Bitflags { width } => {
            decode.push(("width".to_owned(), Value::Integer(*width as i64)));
        }
        _ => {}
    }
    if let Some(field) = &e.field {
        decode.push(("field".to_owned(), Value::Text(field.clone())));
    }
    Value::Map(Map::from_iter([
        ("name".to_owned(), Value::Text(e.display_name.clone())),
        ("decode".to_owned(), Value::Map(Map::from_iter(decode))),
    ]))
}

/// Field types that cannot be alias or type names.
pub const RESERVED_TYPE_WORDS: [&str; 4] = ["struct", "array", "soa", "chunk"];
