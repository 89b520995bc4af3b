//! Viewport-scoped overlay spans.
//!
//! A [`SpanGenerator`] turns a [`ParseResult`] into the leaf spans visible in
//! a half-open byte viewport, with a binary-searchable index. Record lookup
//! is O(log n) over a sorted extent table built once per result; an
//! unchanged viewport returns the previously built set pointer-equal.

use std::sync::Arc;

use once_cell::unsync::OnceCell;

use crate::{
    grammar::{Color, Endian, EndianSource, SpanGroup},
    parse::{NodeKind, ParseResult, ParsedNode},
};

/// One leaf interval with its styling metadata. Never zero-length.
#[derive(Clone, PartialEq, Debug)]
pub struct Span {
    pub offset: u64,
    pub length: u64,
    pub path: String,
    pub group: SpanGroup,
    pub endian: Endian,
    pub endian_source: EndianSource,
    pub color: Option<Color>,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Sorted, disjoint spans with binary-search lookup.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SpanIndex {
    spans: Vec<Span>,
}

impl SpanIndex {
    pub fn new(mut spans: Vec<Span>) -> Self {
        spans.sort_by_key(|s| (s.offset, s.length));
        Self { spans }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// The span containing `offset`, if any.
    pub fn find(&self, offset: u64) -> Option<&Span> {
        let idx = self.spans.partition_point(|s| s.end() <= offset);
        self.spans.get(idx).filter(|s| s.offset <= offset)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Spans intersecting one viewport.
#[derive(Clone, PartialEq, Debug)]
pub struct SpanSet {
    pub viewport_start: u64,
    pub viewport_end: u64,
    index: SpanIndex,
}

impl SpanSet {
    pub fn spans(&self) -> &[Span] {
        self.index.spans()
    }

    pub fn index(&self) -> &SpanIndex {
        &self.index
    }

    pub fn find(&self, offset: u64) -> Option<&Span> {
        self.index.find(offset)
    }
}

struct RecordExtent {
    offset: u64,
    end: u64,
    record: usize,
}

/// Generates span sets for a parse result. Holds the record extent table and
/// the last viewport's set.
pub struct SpanGenerator<'a> {
    result: &'a ParseResult,
    extents: OnceCell<Vec<RecordExtent>>,
    cache: Option<Arc<SpanSet>>,
}

impl<'a> SpanGenerator<'a> {
    pub fn new(result: &'a ParseResult) -> Self {
        Self {
            result,
            extents: OnceCell::new(),
            cache: None,
        }
    }

    /// Records in offset order, minus those whose parse failed at record
    /// level.
    fn extents(&self) -> &[RecordExtent] {
        self.extents.get_or_init(|| {
            let mut extents: Vec<RecordExtent> = self
                .result
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.error.is_none())
                .map(|(i, r)| RecordExtent {
                    offset: r.offset,
                    end: r.offset + r.size,
                    record: i,
                })
                .collect();
            extents.sort_by_key(|e| (e.offset, e.end));
            extents
        })
    }

    /// Spans of all leaves intersecting `[start, end)`, plus their index.
    pub fn generate(&mut self, start: u64, end: u64) -> Arc<SpanSet> {
        if let Some(cached) = &self.cache {
            if cached.viewport_start == start && cached.viewport_end == end {
                return Arc::clone(cached);
            }
        }
        let mut spans = Vec::new();
        if end > start {
            let extents = self.extents();
            let first = extents.partition_point(|e| e.end <= start);
            for extent in &extents[first..] {
                if extent.offset >= end {
                    break;
                }
                let record = &self.result.records[extent.record];
                for node in &record.nodes {
                    collect_spans(node, start, end, &mut spans);
                }
            }
        }
        let set = Arc::new(SpanSet {
            viewport_start: start,
            viewport_end: end,
            index: SpanIndex::new(spans),
        });
        self.cache = Some(Arc::clone(&set));
        set
    }
}

fn collect_spans(node: &ParsedNode, start: u64, end: u64, out: &mut Vec<Span>) {
    match node.kind {
        NodeKind::Primitive(kind) => {
            if node.length == 0 || node.offset >= end || node.offset + node.length <= start {
                return;
            }
            out.push(Span {
                offset: node.offset,
                length: node.length,
                path: node.path.clone(),
                group: kind.group(),
                endian: node.endian,
                endian_source: node.endian_source,
                color: node.color.clone(),
            });
        }
        _ => {
            for child in &node.children {
                collect_spans(child, start, end, out);
            }
        }
    }
}

#[cfg(test)]
mod tests;
