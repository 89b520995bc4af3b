//! Record filtering over a parse result.

use crate::parse::{ParseResult, ParsedRecord};

/// Pure record filters; results keep file order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RecordFilter {
    /// Records parsed as the named type.
    TypeName(String),
    /// Records whose start offset lies in the half-open range.
    OffsetRange { start: u64, end: u64 },
    /// Records containing a node at the exact record-relative path.
    HasField(String),
}

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid offset range: {start}..{end}")]
    InvalidRange { start: u64, end: u64 },
}

pub fn query_records<'a>(
    result: &'a ParseResult,
    filter: &RecordFilter,
) -> Result<Vec<&'a ParsedRecord>, QueryError> {
    if let RecordFilter::OffsetRange { start, end } = filter {
        if end < start {
            return Err(QueryError::InvalidRange {
                start: *start,
                end: *end,
            });
        }
    }
    Ok(result
        .records
        .iter()
        .filter(|r| matches(r, filter))
        .collect())
}

fn matches(record: &ParsedRecord, filter: &RecordFilter) -> bool {
    match filter {
        RecordFilter::TypeName(name) => record.type_name == *name,
        RecordFilter::OffsetRange { start, end } => {
            record.offset >= *start && record.offset < *end
        }
        RecordFilter::HasField(path) => record.has_path(path),
    }
}
