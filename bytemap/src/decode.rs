//! Registry-driven payload decoding.
//!
//! Turns one field of a [`ParsedRecord`] into a display string, either by an
//! explicit field name with type-driven defaults, or by looking the record's
//! discriminator up in the grammar registry. Decoders are a closed set
//! dispatched here; there is no global decoder registry.

use crate::{
    grammar::{canonical_key, Decoder, Endian, Grammar},
    parse::{decode_text, uint_from_bytes, ParsedField, ParsedRecord, ParsedValue},
};

/// Record field conventionally holding the decodable payload.
const DEFAULT_PAYLOAD_FIELD: &str = "payload";
/// Conventional path of the discriminator leaf.
const DISCRIMINATOR_PATH: &str = "header.type_raw";

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record has no field named '{0}'")]
    MissingField(String),
    #[error("{0}: field has no value")]
    MissingValue(String),
    #[error("record has no discriminator")]
    MissingDiscriminator,
    #[error("no registry entry for key {0}")]
    UnknownRegistryKey(String),
    #[error("{path}: need {needed} bytes, have {have}")]
    InsufficientBytes {
        path: String,
        needed: usize,
        have: usize,
    },
    #[error("{path}: cannot decode {found} as {expected}")]
    WrongValueKind {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}: invalid packed date")]
    InvalidDate(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DecodedValue {
    pub value: String,
    /// Name of the decoder that produced the value.
    pub decoder: &'static str,
    pub field_path: String,
}

/// Decode a field of `record`.
///
/// With `field_name`, that exact leaf is decoded by its own type: decimal
/// for numbers, hex for bytes, text verbatim. Otherwise the discriminator
/// picks a registry entry and that entry's decoder runs against its
/// nominated field (default `payload`).
pub fn decode_record(
    record: &ParsedRecord,
    grammar: &Grammar,
    field_name: Option<&str>,
) -> Result<DecodedValue, DecodeError> {
    if let Some(name) = field_name {
        let field = record
            .leaf(name)
            .ok_or_else(|| DecodeError::MissingField(name.to_owned()))?;
        let value = field_value(field)?;
        let (value, decoder) = default_decode(value);
        return Ok(DecodedValue {
            value,
            decoder,
            field_path: name.to_owned(),
        });
    }

    let key = discriminator_key(record).ok_or(DecodeError::MissingDiscriminator)?;
    let entry = grammar
        .registry_entry(&key)
        .ok_or(DecodeError::UnknownRegistryKey(key))?;
    let target = entry.field.as_deref().unwrap_or(DEFAULT_PAYLOAD_FIELD);
    let field = record
        .leaf(target)
        .ok_or_else(|| DecodeError::MissingField(target.to_owned()))?;
    let value = field_value(field)?;
    let rendered = apply_decoder(&entry.decoder, value, field, grammar)?;
    Ok(DecodedValue {
        value: rendered,
        decoder: entry.decoder.kind_name(),
        field_path: target.to_owned(),
    })
}

fn field_value(field: &ParsedField) -> Result<&ParsedValue, DecodeError> {
    field
        .value
        .as_ref()
        .ok_or_else(|| DecodeError::MissingValue(field.path.clone()))
}

fn discriminator_key(record: &ParsedRecord) -> Option<String> {
    if let Some(key) = &record.discriminator {
        return Some(key.clone());
    }
    let field = record.leaf(DISCRIMINATOR_PATH)?;
    let width = field.kind.fixed_size()?;
    let value = field.value.as_ref()?.as_u64()?;
    Some(canonical_key(value, width))
}

fn default_decode(value: &ParsedValue) -> (String, &'static str) {
    match value {
        ParsedValue::Bytes(b) => (hex::encode(b), "hex"),
        ParsedValue::Str(s) => (s.clone(), "string"),
        other => (other.display(), "int"),
    }
}

fn apply_decoder(
    decoder: &Decoder,
    value: &ParsedValue,
    field: &ParsedField,
    grammar: &Grammar,
) -> Result<String, DecodeError> {
    match decoder {
        Decoder::None => Ok(default_decode(value).0),
        Decoder::Str { encoding } => match value {
            ParsedValue::Str(s) => Ok(s.clone()),
            ParsedValue::Bytes(b) => Ok(decode_text(b, *encoding)),
            other => Err(wrong_kind(field, "string", other)),
        },
        Decoder::U16 { endian } => decode_uint(value, field, 2, *endian, grammar, false),
        Decoder::U32 { endian } => decode_uint(value, field, 4, *endian, grammar, false),
        Decoder::Hex => match value {
            ParsedValue::Bytes(b) => Ok(hex::encode(b)),
            other => Err(wrong_kind(field, "bytes", other)),
        },
        Decoder::FtmPackedDate => decode_packed_date(value, field),
        Decoder::Int {
            width,
            endian,
            signed,
        } => decode_uint(value, field, *width as usize, *endian, grammar, *signed),
        Decoder::Bitflags { width } => {
            let v = uint_value(value, field, *width as usize, None, grammar)?;
            Ok(render_bitflags(v))
        }
    }
}

fn wrong_kind(field: &ParsedField, expected: &'static str, found: &ParsedValue) -> DecodeError {
    let found = match found {
        ParsedValue::Int(_) | ParsedValue::UInt(_) => "integer",
        ParsedValue::Float(_) => "float",
        ParsedValue::Bytes(_) => "bytes",
        ParsedValue::Str(_) => "string",
    };
    DecodeError::WrongValueKind {
        path: field.path.clone(),
        expected,
        found,
    }
}

/// Integer rendering of a value that is already numeric or stored as bytes.
/// The decoder's endianness wins over the grammar default.
fn uint_value(
    value: &ParsedValue,
    field: &ParsedField,
    width: usize,
    endian: Option<Endian>,
    grammar: &Grammar,
) -> Result<u64, DecodeError> {
    match value {
        ParsedValue::Int(_) | ParsedValue::UInt(_) => {
            value.as_u64().ok_or_else(|| wrong_kind(field, "integer", value))
        }
        ParsedValue::Bytes(b) => {
            if b.len() < width {
                return Err(DecodeError::InsufficientBytes {
                    path: field.path.clone(),
                    needed: width,
                    have: b.len(),
                });
            }
            let endian = endian.or(grammar.endian).unwrap_or_default();
            Ok(uint_from_bytes(&b[..width], endian))
        }
        other => Err(wrong_kind(field, "integer", other)),
    }
}

fn decode_uint(
    value: &ParsedValue,
    field: &ParsedField,
    width: usize,
    endian: Option<Endian>,
    grammar: &Grammar,
    signed: bool,
) -> Result<String, DecodeError> {
    if let Some(v) = value.as_i64() {
        if matches!(value, ParsedValue::Int(_) | ParsedValue::UInt(_)) {
            return Ok(v.to_string());
        }
    }
    let raw = uint_value(value, field, width, endian, grammar)?;
    if signed {
        let shift = 64 - width * 8;
        Ok((((raw << shift) as i64) >> shift).to_string())
    } else {
        Ok(raw.to_string())
    }
}

/// `byte0 = (day << 3) | flags`, `byte1 = (month << 1) | 0`, bytes 2-3 the
/// year as little-endian u16. Rendered `YYYY-MM-DD`.
fn decode_packed_date(value: &ParsedValue, field: &ParsedField) -> Result<String, DecodeError> {
    let ParsedValue::Bytes(b) = value else {
        return Err(wrong_kind(field, "bytes", value));
    };
    if b.len() < 4 {
        return Err(DecodeError::InsufficientBytes {
            path: field.path.clone(),
            needed: 4,
            have: b.len(),
        });
    }
    let day = b[0] >> 3;
    let month = b[1] >> 1;
    let year = u16::from_le_bytes([b[2], b[3]]);
    let valid = b[1] & 0x01 == 0 && (1..=12).contains(&month) && (1..=31).contains(&day) && year > 0;
    if !valid {
        return Err(DecodeError::InvalidDate(field.path.clone()));
    }
    Ok(format!("{year:04}-{month:02}-{day:02}"))
}

fn render_bitflags(v: u64) -> String {
    if v == 0 {
        return "(none)".to_owned();
    }
    let mut parts = Vec::new();
    for bit in 0..64 {
        if v & (1 << bit) != 0 {
            parts.push(format!("bit{bit}"));
        }
    }
    parts.join("|")
}
