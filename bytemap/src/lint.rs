//! Grammar document validation.
//!
//! [`lint`] turns grammar text into a validated [`Grammar`], accumulating
//! path-qualified errors and non-fatal warnings. Errors and warnings come out
//! in declaration order; the same input always produces the same report.

use std::str::FromStr;

use ahash::HashMap;
use log::debug;

use crate::{
    document::{self, Map, SyntaxError, Value},
    expr::Expr,
    grammar::{
        canonical_key, ArraySpec, ChunkLengthType, ChunkSpec, Color, Decoder, Endian, Field,
        FieldKind, Framing, Grammar, GrammarFormat, Length, Placement, PrimitiveKind,
        PrimitiveSpec, RecordSwitch, RegistryEntry, SoaSpec, StrEncoding, TypeDef, Validation,
        ValueFormat, RESERVED_TYPE_WORDS,
    },
};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum LintError {
    #[error("{0}")]
    Syntax(#[from] SyntaxError),
    #[error("{path}: {message}")]
    Semantic { path: String, message: String },
    #[error("{path}: {message}")]
    Unsupported { path: String, message: String },
}

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum LintWarning {
    #[error("grammar defines no types")]
    NoTypes,
    #[error("type '{0}' is not reachable from the record switch")]
    UnusedType(String),
}

/// Outcome of linting one document.
#[derive(Clone, PartialEq, Debug)]
pub struct LintReport {
    pub grammar: Option<Grammar>,
    pub errors: Vec<LintError>,
    pub warnings: Vec<LintWarning>,
}

impl LintReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.grammar.is_some()
    }
}

/// Validate grammar text. Never panics; malformed input lands in `errors`.
pub fn lint(text: &str) -> LintReport {
    let root = match document::parse_document(text) {
        Ok(v) => v,
        Err(e) => {
            return LintReport {
                grammar: None,
                errors: vec![LintError::Syntax(e)],
                warnings: Vec::new(),
            }
        }
    };
    let root = root.as_map().expect("document root is a mapping");

    let mut linter = Linter {
        types_raw: root.get("types").and_then(Value::as_map),
        errors: Vec::new(),
        warnings: Vec::new(),
        resolved_aliases: HashMap::default(),
    };
    let grammar = linter.run(root);
    debug!(
        "lint: {} errors, {} warnings",
        linter.errors.len(),
        linter.warnings.len()
    );
    LintReport {
        grammar: if linter.errors.is_empty() {
            Some(grammar)
        } else {
            None
        },
        errors: linter.errors,
        warnings: linter.warnings,
    }
}

struct Linter<'a> {
    types_raw: Option<&'a Map>,
    errors: Vec<LintError>,
    warnings: Vec<LintWarning>,
    /// Memoized alias specs; `None` marks a spec that already failed.
    resolved_aliases: HashMap<String, Option<Map>>,
}

impl<'a> Linter<'a> {
    fn err(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(LintError::Semantic {
            path: path.into(),
            message: message.into(),
        });
    }

    fn unsupported(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(LintError::Unsupported {
            path: path.into(),
            message: message.into(),
        });
    }

    fn check_dups(&mut self, path: &str, map: &Map) {
        for key in map.duplicate_keys() {
            self.err(path, format!("duplicate key '{key}'"));
        }
    }

    fn run(&mut self, root: &'a Map) -> Grammar {
        self.check_dups("document", root);

        let format = match root.get("format") {
            None => {
                self.err("format", "format is required");
                GrammarFormat::default()
            }
            Some(v) => match v.as_str().map(GrammarFormat::from_str) {
                Some(Ok(f)) => f,
                _ => {
                    self.unsupported(
                        "format",
                        format!("unsupported format: {}", describe(v)),
                    );
                    GrammarFormat::default()
                }
            },
        };

        let endian = root
            .get("endian")
            .and_then(|v| self.parse_endian(v, "endian"));

        let framing = match root.get("framing") {
            None => Framing::default(),
            Some(Value::Map(m)) => {
                self.check_dups("framing", m);
                match m.get("repeat") {
                    None => Framing::default(),
                    Some(v) => match v.as_str().map(Framing::from_str) {
                        Some(Ok(f)) => f,
                        _ => {
                            self.unsupported(
                                "framing.repeat",
                                format!("unsupported repeat policy: {}", describe(v)),
                            );
                            Framing::default()
                        }
                    },
                }
            }
            Some(v) => {
                self.err("framing", format!("must be a mapping, got {}", v.kind_name()));
                Framing::default()
            }
        };

        let types = self.parse_types();
        let switch = self.parse_switch(root, &types);
        let registry = self.parse_registry(root, switch.as_ref());
        self.collect_warnings(switch.as_ref());

        Grammar {
            format,
            endian,
            framing,
            switch,
            types,
            registry,
        }
    }

    fn parse_endian(&mut self, v: &Value, path: &str) -> Option<Endian> {
        match v.as_str().map(Endian::from_str) {
            Some(Ok(e)) => Some(e),
            _ => {
                self.err(path, "endian must be 'little' or 'big'");
                None
            }
        }
    }

    fn parse_color(&mut self, v: &Value, path: &str) -> Option<Color> {
        let Some(s) = v.as_str() else {
            self.err(path, format!("color must be a string, got {}", v.kind_name()));
            return None;
        };
        match Color::parse(s) {
            Ok(c) => Some(c),
            Err(e) => {
                self.err(path, e.to_string());
                None
            }
        }
    }

    // ---- types ----

    fn parse_types(&mut self) -> Vec<TypeDef> {
        let Some(types) = self.types_raw else {
            return Vec::new();
        };
        self.check_dups("types", types);
        let mut out = Vec::new();
        for (name, spec) in types.iter() {
            let ctx = format!("types.{name}");
            let Some(spec) = spec.as_map() else {
                self.err(&ctx, "type definition must be a mapping");
                continue;
            };
            if is_struct_spec(spec) {
                if let Some(def) = self.parse_type_def(name, spec, &ctx) {
                    out.push(def);
                }
            } else {
                // Alias: validated (and memoized) so unused broken aliases
                // still surface, then expanded at use sites.
                self.resolve_alias_spec(name, &[]);
            }
        }
        out
    }

    fn parse_type_def(&mut self, name: &str, spec: &Map, ctx: &str) -> Option<TypeDef> {
        self.check_dups(ctx, spec);
        let endian = spec
            .get("endian")
            .and_then(|v| self.parse_endian(v, &format!("{ctx}.endian")));
        let color = spec
            .get("color")
            .and_then(|v| self.parse_color(v, &format!("{ctx}.color")));
        let fields = self.parse_struct_fields(spec, ctx, &[], &[name.to_owned()])?;
        Some(TypeDef {
            name: name.to_owned(),
            endian,
            color,
            fields,
        })
    }

    fn parse_struct_fields(
        &mut self,
        spec: &Map,
        ctx: &str,
        parent_prior: &[String],
        stack: &[String],
    ) -> Option<Vec<Field>> {
        let Some(raw_fields) = spec.get("fields").and_then(Value::as_array) else {
            self.err(ctx, "fields must be a non-empty list for struct");
            return None;
        };
        if raw_fields.is_empty() {
            self.err(ctx, "fields must be a non-empty list for struct");
            return None;
        }
        let mut fields = Vec::with_capacity(raw_fields.len());
        let mut declared: Vec<String> = Vec::new();
        for (j, raw) in raw_fields.iter().enumerate() {
            let fctx = format!("{ctx}.fields[{j}]");
            let Some(raw) = raw.as_map() else {
                self.err(&fctx, "must be a mapping");
                continue;
            };
            if let Some(field) = self.parse_node(raw, &fctx, &declared, parent_prior, stack, false) {
                self.check_references(&field, &fctx, &declared, parent_prior);
                declared.push(field.name.clone());
                fields.push(field);
            }
        }
        Some(fields)
    }

    /// Every length reference the field carries must name an already-declared
    /// sibling, or a sibling of the enclosing struct.
    fn check_references(
        &mut self,
        field: &Field,
        ctx: &str,
        declared: &[String],
        parent_prior: &[String],
    ) {
        let lengths = match &field.kind {
            FieldKind::Primitive(p) => p.length.iter().collect::<Vec<_>>(),
            FieldKind::Array(a) => vec![&a.length],
            FieldKind::Soa(s) => vec![&s.length],
            FieldKind::Struct(_) | FieldKind::Chunk(_) => Vec::new(),
        };
        for length in lengths {
            for name in length.references() {
                let known = declared.iter().any(|d| d == name)
                    || parent_prior.iter().any(|d| d == name);
                if !known {
                    self.err(
                        ctx,
                        format!("length_ref '{name}' references unknown or later field in struct"),
                    );
                }
            }
        }
    }

    // ---- fields ----

    #[allow(clippy::too_many_arguments)]
    fn parse_node(
        &mut self,
        spec: &Map,
        ctx: &str,
        prior: &[String],
        parent_prior: &[String],
        stack: &[String],
        is_chunk_payload: bool,
    ) -> Option<Field> {
        self.check_dups(ctx, spec);

        let name = match spec.get("name") {
            Some(Value::Text(s)) if !s.is_empty() => s.clone(),
            _ => {
                self.err(format!("{ctx}.name"), "is required");
                return None;
            }
        };

        let placement = self.parse_placement(spec, ctx)?;
        let endian = spec
            .get("endian")
            .and_then(|v| self.parse_endian(v, &format!("{ctx}.endian")));
        let color = spec
            .get("color")
            .and_then(|v| self.parse_color(v, &format!("{ctx}.color")));
        let validate = self.parse_validation(spec, ctx);
        let format = self.parse_format(spec, ctx);

        let Some(ftype) = spec.get("type").and_then(Value::as_str) else {
            self.err(format!("{ctx}.type"), "is required");
            return None;
        };

        // Shorthand: type: "array of <TypeName>"
        if let Some(element_type) = ftype.strip_prefix("array of ") {
            if spec.contains_key("element") {
                self.err(ctx, "array-of shorthand cannot also specify 'element'");
                return None;
            }
            let rewritten = rewrite_array_of(spec, element_type);
            return self.parse_node(&rewritten, ctx, prior, parent_prior, stack, is_chunk_payload);
        }

        let kind = if let Ok(prim) = PrimitiveKind::from_str(ftype) {
            FieldKind::Primitive(self.parse_primitive(prim, spec, ctx, is_chunk_payload)?)
        } else {
            match ftype {
                "struct" => {
                    FieldKind::Struct(self.parse_struct_fields(spec, ctx, prior, stack)?)
                }
                "array" => self.parse_array(spec, ctx, stack)?,
                "chunk" => FieldKind::Chunk(self.parse_chunk(spec, ctx, stack)?),
                other => {
                    return self.expand_type_reference(
                        other,
                        spec,
                        ctx,
                        &name,
                        placement,
                        prior,
                        parent_prior,
                        stack,
                    )
                }
            }
        };

        Some(Field {
            name,
            placement,
            endian,
            color,
            validate,
            format,
            kind,
        })
    }

    fn parse_placement(&mut self, spec: &Map, ctx: &str) -> Option<Placement> {
        let offset = spec.get("offset");
        let skip = spec.get("skip");
        if offset.is_some() && skip.is_some() {
            self.err(ctx, "cannot specify both offset and skip");
            return None;
        }
        if let Some(v) = offset {
            let Some(n) = as_offset_int(v) else {
                self.err(
                    format!("{ctx}.offset"),
                    "must be a non-negative integer",
                );
                return None;
            };
            return Some(Placement::At(n));
        }
        if let Some(v) = skip {
            let Some(n) = as_offset_int(v) else {
                self.err(format!("{ctx}.skip"), "must be a non-negative integer");
                return None;
            };
            return Some(Placement::Skip(n));
        }
        Some(Placement::Next)
    }

    fn parse_validation(&mut self, spec: &Map, ctx: &str) -> Option<Validation> {
        let v = spec.get("validate")?;
        let Some(m) = v.as_map() else {
            self.err(format!("{ctx}.validate"), "must be a mapping");
            return None;
        };
        if let Some(v) = m.get("equals") {
            return match v.as_int() {
                Some(n) => Some(Validation::Equals(n)),
                None => {
                    self.err(format!("{ctx}.validate.equals"), "must be an integer");
                    None
                }
            };
        }
        if let Some(v) = m.get("equals_field") {
            return match v.as_str() {
                Some(s) => Some(Validation::EqualsField(s.to_owned())),
                None => {
                    self.err(format!("{ctx}.validate.equals_field"), "must be a field name");
                    None
                }
            };
        }
        if let Some(v) = m.get("all_bytes") {
            return match v.as_int().and_then(|n| u8::try_from(n).ok()) {
                Some(b) => Some(Validation::AllBytes(b)),
                None => {
                    self.err(format!("{ctx}.validate.all_bytes"), "must be a byte value");
                    None
                }
            };
        }
        self.err(
            format!("{ctx}.validate"),
            "expected one of equals, equals_field, all_bytes",
        );
        None
    }

    fn parse_format(&mut self, spec: &Map, ctx: &str) -> Option<ValueFormat> {
        let v = spec.get("format")?;
        match v.as_str().map(ValueFormat::from_str) {
            Some(Ok(f)) => Some(f),
            _ => {
                self.err(
                    format!("{ctx}.format"),
                    format!("unsupported format tag: {}", describe(v)),
                );
                None
            }
        }
    }

    fn parse_length_value(&mut self, v: &Value, path: &str) -> Option<Length> {
        match v {
            Value::Integer(n) => {
                if *n < 0 {
                    self.err(path, "must be non-negative");
                    None
                } else {
                    Some(Length::Fixed(*n as u64))
                }
            }
            Value::Text(s) => {
                let s = s.trim();
                // Numeric string, hex supported
                let number = if let Some(hex) = s.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16).ok()
                } else {
                    s.parse::<u64>().ok()
                };
                if let Some(n) = number {
                    return Some(Length::Fixed(n));
                }
                if s.contains(['+', '-', '*', '/', '(', ')']) {
                    match Expr::parse(s) {
                        Ok(e) => Some(Length::Expr(e)),
                        Err(e) => {
                            self.err(path, e.to_string());
                            None
                        }
                    }
                } else if s.is_empty() {
                    self.err(path, "invalid length value");
                    None
                } else {
                    Some(Length::Ref(s.to_owned()))
                }
            }
            other => {
                self.err(
                    path,
                    format!("invalid length value: {}", other.kind_name()),
                );
                None
            }
        }
    }

    /// `length_field` / `length_expr` are explicit spellings; `length` is the
    /// sugar form resolved by shape.
    fn parse_length_spec(&mut self, spec: &Map, ctx: &str) -> Option<Length> {
        if let Some(v) = spec.get("length_field") {
            return match v.as_str() {
                Some(s) if !s.is_empty() => Some(Length::Ref(s.to_owned())),
                _ => {
                    self.err(format!("{ctx}.length_field"), "must be a field name");
                    None
                }
            };
        }
        if let Some(v) = spec.get("length_expr") {
            let Some(s) = v.as_str() else {
                self.err(format!("{ctx}.length_expr"), "must be an expression string");
                return None;
            };
            return match Expr::parse(s) {
                Ok(e) => Some(Length::Expr(e)),
                Err(e) => {
                    self.err(format!("{ctx}.length_expr"), e.to_string());
                    None
                }
            };
        }
        let v = spec.get("length")?;
        self.parse_length_value(v, &format!("{ctx}.length"))
    }

    fn parse_encoding(&mut self, spec: &Map, ctx: &str) -> Option<StrEncoding> {
        let v = spec.get("encoding")?;
        match v.as_str().map(StrEncoding::from_str) {
            Some(Ok(e)) => Some(e),
            _ => {
                self.err(
                    format!("{ctx}.encoding"),
                    format!("unsupported encoding: {}", describe(v)),
                );
                None
            }
        }
    }

    fn parse_primitive(
        &mut self,
        kind: PrimitiveKind,
        spec: &Map,
        ctx: &str,
        is_chunk_payload: bool,
    ) -> Option<PrimitiveSpec> {
        let mut prim = PrimitiveSpec::numeric(kind);
        match kind {
            PrimitiveKind::Bytes => {
                prim.encoding = self.parse_encoding(spec, ctx);
                prim.length = self.parse_length_spec(spec, ctx);
                if prim.length.is_none() && !is_chunk_payload {
                    self.err(
                        format!("{ctx}.length"),
                        "required for bytes (int or ref)",
                    );
                    return None;
                }
            }
            PrimitiveKind::String => {
                prim.encoding = Some(self.parse_encoding(spec, ctx).unwrap_or_default());
                if spec.get("null_terminated").and_then(Value::as_bool) == Some(true) {
                    let max_len = spec.get("max_length").and_then(Value::as_uint);
                    match max_len {
                        Some(n) if n > 0 => {
                            prim.null_terminated = true;
                            prim.max_length = Some(n);
                        }
                        _ => {
                            self.err(
                                format!("{ctx}.max_length"),
                                "required and must be > 0 when null_terminated",
                            );
                            return None;
                        }
                    }
                } else {
                    prim.length = self.parse_length_spec(spec, ctx);
                    if prim.length.is_none() && !is_chunk_payload {
                        self.err(
                            format!("{ctx}.length"),
                            "required for string (int or ref)",
                        );
                        return None;
                    }
                }
            }
            _ => {}
        }
        Some(prim)
    }

    fn parse_array(&mut self, spec: &Map, ctx: &str, stack: &[String]) -> Option<FieldKind> {
        let Some(length) = self.parse_length_spec(spec, ctx) else {
            self.err(ctx, "requires length");
            return None;
        };
        if spec.get("layout").and_then(Value::as_str) == Some("soa") {
            return self.parse_soa(spec, ctx, length, stack);
        }
        let stride = match spec.get("stride") {
            None => None,
            Some(v) => match v.as_uint() {
                Some(n) if n > 0 => Some(n),
                _ => {
                    self.err(format!("{ctx}.stride"), "must be > 0 if provided");
                    return None;
                }
            },
        };
        let Some(element) = spec.get("element").and_then(Value::as_map) else {
            self.err(format!("{ctx}.element"), "must be a mapping");
            return None;
        };
        // Elements lay out by stride; any offset/skip on the spec is ignored.
        let element = with_entries(element, [("name", Value::Text("elem".to_owned()))]);
        let element = self.parse_node(&element, &format!("{ctx}.element"), &[], &[], stack, false)?;
        Some(FieldKind::Array(ArraySpec {
            length,
            element: Box::new(Field {
                placement: Placement::Next,
                ..element
            }),
            stride,
        }))
    }

    fn parse_soa(
        &mut self,
        spec: &Map,
        ctx: &str,
        length: Length,
        stack: &[String],
    ) -> Option<FieldKind> {
        let Some(raw_fields) = spec.get("fields").and_then(Value::as_array) else {
            self.err(
                format!("{ctx}.fields"),
                "must be a non-empty list for layout: soa",
            );
            return None;
        };
        if raw_fields.is_empty() {
            self.err(
                format!("{ctx}.fields"),
                "must be a non-empty list for layout: soa",
            );
            return None;
        }
        let mut columns = Vec::with_capacity(raw_fields.len());
        for (j, raw) in raw_fields.iter().enumerate() {
            let fctx = format!("{ctx}.fields[{j}]");
            let Some(raw) = raw.as_map() else {
                self.err(&fctx, "must be a mapping");
                continue;
            };
            if raw.contains_key("offset") || raw.contains_key("skip") {
                self.err(&fctx, "offset/skip not allowed for layout: soa");
                continue;
            }
            let named = if raw.contains_key("name") {
                raw.clone()
            } else {
                with_entries(raw, [("name", Value::Text(format!("f{j}")))])
            };
            let Some(column) = self.parse_node(&named, &fctx, &[], &[], stack, false) else {
                continue;
            };
            let FieldKind::Primitive(prim) = &column.kind else {
                self.err(&fctx, "must be a fixed-size primitive for layout: soa");
                continue;
            };
            if prim.kind == PrimitiveKind::String && prim.null_terminated {
                self.err(&fctx, "string cannot be null_terminated for layout: soa");
                continue;
            }
            if prim.fixed_size().is_none() {
                self.err(&fctx, "requires a fixed size for layout: soa");
                continue;
            }
            if prim.kind == PrimitiveKind::Bytes && prim.fixed_size() == Some(0) {
                self.err(&fctx, "bytes requires positive length for layout: soa");
                continue;
            }
            columns.push(column);
        }
        if columns.is_empty() {
            return None;
        }
        Some(FieldKind::Soa(SoaSpec { length, columns }))
    }

    fn parse_chunk(&mut self, spec: &Map, ctx: &str, stack: &[String]) -> Option<ChunkSpec> {
        let length_type = match spec.get("length_type").and_then(Value::as_str) {
            None => {
                self.err(format!("{ctx}.length_type"), "required for chunk");
                return None;
            }
            Some(s) => match ChunkLengthType::from_str(s) {
                Ok(t) => t,
                Err(_) => {
                    self.err(
                        format!("{ctx}.length_type"),
                        "must be one of: u16 BE, u16 LE, u32 BE, u32 LE, u8",
                    );
                    return None;
                }
            },
        };
        let length_includes_header = spec
            .get("length_includes_header")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let payload_spec = match spec.get("payload") {
            None => Map::from_iter([
                ("name".to_owned(), Value::Text("payload".to_owned())),
                ("type".to_owned(), Value::Text("bytes".to_owned())),
            ]),
            Some(Value::Map(m)) => with_entries(m, [("name", Value::Text("payload".to_owned()))]),
            Some(v) => {
                self.err(
                    format!("{ctx}.payload"),
                    format!("must be a mapping, got {}", v.kind_name()),
                );
                return None;
            }
        };
        let payload =
            self.parse_node(&payload_spec, &format!("{ctx}.payload"), &[], &[], stack, true)?;
        Some(ChunkSpec {
            length_type,
            length_includes_header,
            payload: Box::new(Field {
                placement: Placement::Next,
                ..payload
            }),
        })
    }

    // ---- type references and aliases ----

    /// A field whose `type` names a declared type: expand the resolved spec
    /// with call-site overrides merged on top.
    #[allow(clippy::too_many_arguments)]
    fn expand_type_reference(
        &mut self,
        tname: &str,
        spec: &Map,
        ctx: &str,
        name: &str,
        placement: Placement,
        prior: &[String],
        parent_prior: &[String],
        stack: &[String],
    ) -> Option<Field> {
        if stack.iter().any(|s| s == tname) {
            let chain = stack
                .iter()
                .map(String::as_str)
                .chain([tname])
                .collect::<Vec<_>>()
                .join(" -> ");
            self.err(ctx, format!("type cycle detected: {chain}"));
            return None;
        }
        let alias_spec = self.resolve_alias_spec(tname, stack)?;

        // Merge: alias body first, call-site overrides win. Name and layout
        // always come from the call site.
        let mut merged: Vec<(String, Value)> = alias_spec
            .iter()
            .filter(|(k, _)| !matches!(*k, "name" | "offset" | "skip"))
            .map(|(k, v)| (k.to_owned(), v.clone()))
            .collect();
        for (k, v) in spec.iter() {
            if matches!(k, "type" | "name" | "offset" | "skip") {
                continue;
            }
            merged.retain(|(mk, _)| mk != k);
            merged.push((k.to_owned(), v.clone()));
        }
        merged.push(("name".to_owned(), Value::Text(name.to_owned())));
        let merged: Map = merged.into_iter().collect();

        let mut stack = stack.to_vec();
        stack.push(tname.to_owned());
        let expanded = self.parse_node(
            &merged,
            &format!("{ctx}.expanded"),
            prior,
            parent_prior,
            &stack,
            false,
        )?;
        Some(Field {
            placement,
            ..expanded
        })
    }

    /// Resolve a named type to its raw spec, chasing alias chains with cycle
    /// detection and memoization.
    fn resolve_alias_spec(&mut self, tname: &str, stack: &[String]) -> Option<Map> {
        if let Some(memo) = self.resolved_aliases.get(tname) {
            return memo.clone();
        }
        let resolved = self.resolve_alias_uncached(tname, stack);
        self.resolved_aliases
            .insert(tname.to_owned(), resolved.clone());
        resolved
    }

    fn resolve_alias_uncached(&mut self, tname: &str, stack: &[String]) -> Option<Map> {
        let ctx = format!("types.{tname}");
        let tdef = self.types_raw.and_then(|t| t.get(tname));
        let Some(tdef) = tdef else {
            self.err(&ctx, format!("unknown type reference: {tname}"));
            return None;
        };
        let Some(tdef) = tdef.as_map() else {
            self.err(&ctx, "must be a mapping with a 'type'");
            return None;
        };
        let mut spec = tdef.clone();
        if is_struct_spec(&spec) && !spec.contains_key("type") {
            spec = with_entries(&spec, [("type", Value::Text("struct".to_owned()))]);
        }
        let Some(inner) = spec.get("type").and_then(Value::as_str).map(str::to_owned) else {
            self.err(&ctx, "must be a mapping with a 'type'");
            return None;
        };
        if let Some(element_type) = inner.strip_prefix("array of ") {
            if spec.contains_key("element") {
                self.err(&ctx, "array-of shorthand cannot also specify 'element'");
                return None;
            }
            spec = rewrite_array_of(&spec, element_type);
        } else if PrimitiveKind::from_str(&inner).is_err()
            && !RESERVED_TYPE_WORDS.contains(&inner.as_str())
        {
            // Alias chaining: inner refers to another alias.
            if stack.iter().any(|s| s == &inner) || inner == tname {
                let chain = stack
                    .iter()
                    .map(String::as_str)
                    .chain([tname, inner.as_str()])
                    .collect::<Vec<_>>()
                    .join(" -> ");
                self.err(&ctx, format!("type cycle detected: {chain}"));
                return None;
            }
            let mut stack = stack.to_vec();
            stack.push(tname.to_owned());
            let base = self.resolve_alias_spec(&inner, &stack)?;
            let mut merged: Vec<(String, Value)> = base
                .iter()
                .map(|(k, v)| (k.to_owned(), v.clone()))
                .collect();
            for (k, v) in spec.iter() {
                if k == "type" {
                    continue;
                }
                merged.retain(|(mk, _)| mk != k);
                merged.push((k.to_owned(), v.clone()));
            }
            spec = merged.into_iter().collect();
        }
        // Bounded strings are checked here so broken aliases fail even when
        // unused.
        if spec.get("type").and_then(Value::as_str) == Some("string")
            && spec.get("null_terminated").and_then(Value::as_bool) == Some(true)
        {
            let ok = spec
                .get("max_length")
                .and_then(Value::as_uint)
                .is_some_and(|n| n > 0);
            if !ok {
                self.err(
                    format!("{ctx}.max_length"),
                    "required and must be > 0 when null_terminated",
                );
                return None;
            }
        }
        Some(spec)
    }

    // ---- record switch ----

    fn parse_switch(&mut self, root: &Map, types: &[TypeDef]) -> Option<RecordSwitch> {
        let record = root.get("record")?;
        let Some(record) = record.as_map() else {
            self.err("record", "must be a mapping");
            return None;
        };
        self.check_dups("record", record);
        let switch = record.get("switch")?;
        let Some(switch) = switch.as_map() else {
            self.err("record.switch", "must be a mapping");
            return None;
        };
        self.check_dups("record.switch", switch);

        let Some(expr) = switch.get("expr").and_then(Value::as_str) else {
            self.err("record.switch.expr", "is required");
            return None;
        };
        let mut parts = expr.split('.');
        let (header_type, field) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(f), None) if !t.is_empty() && !f.is_empty() => {
                (t.to_owned(), f.to_owned())
            }
            _ => {
                self.err(
                    "record.switch.expr",
                    "must have the form TypeName.field_name",
                );
                return None;
            }
        };

        let field_width = match types.iter().find(|t| t.name == header_type) {
            None => {
                self.err(
                    "record.switch.expr",
                    format!("unknown type reference: {header_type}"),
                );
                return None;
            }
            Some(t) => match t.fields.iter().find(|f| f.name == field) {
                Some(Field {
                    kind: FieldKind::Primitive(p),
                    ..
                }) if p.kind.is_integer() => p.kind.fixed_size().expect("integer width"),
                Some(_) => {
                    self.err(
                        "record.switch.expr",
                        format!("discriminator {header_type}.{field} must be an integer field"),
                    );
                    return None;
                }
                None => {
                    self.err(
                        "record.switch.expr",
                        format!("{header_type} has no field named {field}"),
                    );
                    return None;
                }
            },
        };

        let mut cases = Vec::new();
        if let Some(raw_cases) = switch.get("cases") {
            let Some(raw_cases) = raw_cases.as_map() else {
                self.err("record.switch.cases", "must be a mapping");
                return None;
            };
            for (key, target) in raw_cases.iter() {
                let cctx = format!("record.switch.cases.{key}");
                let Some(canonical) = self.canonicalize_key(key, field_width, &cctx) else {
                    continue;
                };
                let Some(target) = target.as_str() else {
                    self.err(&cctx, "case target must be a type name");
                    continue;
                };
                if !types.iter().any(|t| t.name == target) {
                    self.err(&cctx, format!("unknown type reference: {target}"));
                    continue;
                }
                if cases.iter().any(|(k, _)| k == &canonical) {
                    self.err(&cctx, format!("duplicate case key {canonical}"));
                    continue;
                }
                cases.push((canonical, target.to_owned()));
            }
        }

        let Some(default) = switch.get("default").and_then(Value::as_str) else {
            self.err("record.switch.default", "is required");
            return None;
        };
        if !types.iter().any(|t| t.name == default) {
            self.err(
                "record.switch.default",
                format!("unknown type reference: {default}"),
            );
            return None;
        }

        Some(RecordSwitch {
            header_type,
            field,
            field_width,
            cases,
            default: default.to_owned(),
        })
    }

    /// Keys are written as hex strings; they are rewritten to the canonical
    /// form so parser lookups cannot miss on case or padding.
    fn canonicalize_key(&mut self, key: &str, width: u64, ctx: &str) -> Option<String> {
        let digits = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X"));
        let value = digits.and_then(|d| u64::from_str_radix(d, 16).ok());
        match value {
            Some(v) if width >= 8 || v < 1u64 << (width * 8) => Some(canonical_key(v, width)),
            Some(_) => {
                self.err(ctx, format!("key does not fit a {width}-byte discriminator"));
                None
            }
            None => {
                self.err(ctx, "key must be a 0x-prefixed hex string");
                None
            }
        }
    }

    // ---- registry ----

    fn parse_registry(
        &mut self,
        root: &Map,
        switch: Option<&RecordSwitch>,
    ) -> Vec<(String, RegistryEntry)> {
        let Some(raw) = root.get("registry") else {
            return Vec::new();
        };
        let Some(raw) = raw.as_map() else {
            self.err("registry", "must be a mapping");
            return Vec::new();
        };
        self.check_dups("registry", raw);
        let width = switch.map_or(2, |s| s.field_width);
        let mut out: Vec<(String, RegistryEntry)> = Vec::new();
        for (key, entry) in raw.iter() {
            let ctx = format!("registry.{key}");
            let Some(canonical) = self.canonicalize_key(key, width, &ctx) else {
                continue;
            };
            let Some(entry) = entry.as_map() else {
                self.err(&ctx, "must be a mapping");
                continue;
            };
            self.check_dups(&ctx, entry);
            let Some(display_name) = entry.get("name").and_then(Value::as_str) else {
                self.err(format!("{ctx}.name"), "is required");
                continue;
            };
            let Some(parsed) = self.parse_decoder(entry.get("decode"), &ctx) else {
                continue;
            };
            if out.iter().any(|(k, _)| k == &canonical) {
                self.err(&ctx, format!("duplicate registry key {canonical}"));
                continue;
            }
            out.push((
                canonical,
                RegistryEntry {
                    display_name: display_name.to_owned(),
                    decoder: parsed.0,
                    field: parsed.1,
                },
            ));
        }
        out
    }

    fn parse_decoder(
        &mut self,
        decode: Option<&Value>,
        ctx: &str,
    ) -> Option<(Decoder, Option<String>)> {
        let Some(decode) = decode else {
            return Some((Decoder::Hex, None));
        };
        let Some(decode) = decode.as_map() else {
            self.err(format!("{ctx}.decode"), "must be a mapping");
            return None;
        };
        self.check_dups(&format!("{ctx}.decode"), decode);
        let field = decode
            .get("field")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let as_type = decode.get("as").and_then(Value::as_str).unwrap_or("hex");
        let endian = match decode.get("endian") {
            None => None,
            Some(v) => self.parse_endian(v, &format!("{ctx}.decode.endian")),
        };
        let decoder = match as_type {
            "none" => Decoder::None,
            "string" => Decoder::Str {
                encoding: self
                    .parse_encoding(decode, &format!("{ctx}.decode"))
                    .unwrap_or_default(),
            },
            "u16" => Decoder::U16 { endian },
            "u32" => Decoder::U32 { endian },
            "hex" => Decoder::Hex,
            "ftm_packed_date" => Decoder::FtmPackedDate,
            "int" => {
                let width = self.parse_decoder_width(decode, ctx)?;
                Decoder::Int {
                    width,
                    endian,
                    signed: decode.get("signed").and_then(Value::as_bool).unwrap_or(false),
                }
            }
            "bitflags" => Decoder::Bitflags {
                width: self.parse_decoder_width(decode, ctx)?,
            },
            other => {
                self.unsupported(
                    format!("{ctx}.decode.as"),
                    format!("unknown decoder: {other}"),
                );
                return None;
            }
        };
        Some((decoder, field))
    }

    fn parse_decoder_width(&mut self, decode: &Map, ctx: &str) -> Option<u8> {
        match decode.get("width").and_then(Value::as_uint) {
            Some(n @ (1 | 2 | 4 | 8)) => Some(n as u8),
            _ => {
                self.err(format!("{ctx}.decode.width"), "must be 1, 2, 4 or 8");
                None
            }
        }
    }

    // ---- warnings ----

    fn collect_warnings(&mut self, switch: Option<&RecordSwitch>) {
        let Some(types) = self.types_raw else {
            self.warnings.push(LintWarning::NoTypes);
            return;
        };
        if types.is_empty() {
            self.warnings.push(LintWarning::NoTypes);
            return;
        }
        let Some(switch) = switch else {
            return;
        };

        let mut reachable: Vec<&str> = vec![switch.header_type.as_str(), switch.default.as_str()];
        reachable.extend(switch.cases.iter().map(|(_, t)| t.as_str()));
        let mut queue = reachable.clone();
        while let Some(name) = queue.pop() {
            let Some(spec) = types.get(name) else {
                continue;
            };
            let mut refs = Vec::new();
            collect_type_refs(spec, &mut refs);
            for r in refs {
                if types.contains_key(r) && !reachable.contains(&r) {
                    reachable.push(r);
                    queue.push(r);
                }
            }
        }
        for name in types.keys() {
            if !reachable.contains(&name) {
                self.warnings.push(LintWarning::UnusedType(name.to_owned()));
            }
        }
    }
}

fn describe(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        other => other.kind_name().to_owned(),
    }
}

fn is_struct_spec(spec: &Map) -> bool {
    match spec.get("type").and_then(Value::as_str) {
        Some("struct") => true,
        None => spec.contains_key("fields"),
        _ => false,
    }
}

fn as_offset_int(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(n) => u64::try_from(*n).ok(),
        Value::Text(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x") {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

/// Copy of `base` with `entries` replacing any same-named keys.
fn with_entries<'v>(
    base: &Map,
    entries: impl IntoIterator<Item = (&'v str, Value)>,
) -> Map {
    let mut out: Vec<(String, Value)> = base
        .iter()
        .map(|(k, v)| (k.to_owned(), v.clone()))
        .collect();
    for (k, v) in entries {
        out.retain(|(mk, _)| mk != k);
        out.push((k.to_owned(), v));
    }
    out.into_iter().collect()
}

fn rewrite_array_of(spec: &Map, element_type: &str) -> Map {
    with_entries(
        spec,
        [
            ("type", Value::Text("array".to_owned())),
            (
                "element",
                Value::Map(Map::from_iter([(
                    "type".to_owned(),
                    Value::Text(element_type.to_owned()),
                )])),
            ),
        ],
    )
}

/// Type names referenced anywhere inside a raw type spec, for reachability.
fn collect_type_refs<'a>(v: &'a Value, out: &mut Vec<&'a str>) {
    let Some(m) = v.as_map() else {
        if let Some(items) = v.as_array() {
            for item in items {
                collect_type_refs(item, out);
            }
        }
        return;
    };
    if let Some(t) = m.get("type").and_then(Value::as_str) {
        let t = t.strip_prefix("array of ").unwrap_or(t);
        if PrimitiveKind::from_str(t).is_err() && !RESERVED_TYPE_WORDS.contains(&t) {
            out.push(t);
        }
    }
    for key in ["fields", "element", "payload"] {
        if let Some(inner) = m.get(key) {
            collect_type_refs(inner, out);
        }
    }
}
