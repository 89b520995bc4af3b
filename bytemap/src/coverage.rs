//! Mapped / unmapped partitioning of a parsed file.
//!
//! Every error-free leaf contributes its byte interval; intervals are merged
//! and complemented against `[0, file_size)` to produce the gap table.

use itertools::Itertools;

use crate::parse::ParseResult;

/// Half-open `[start, end)` interval.
pub type Interval = (u64, u64);

#[derive(Clone, PartialEq, Debug)]
pub struct CoverageReport {
    pub file_size: u64,
    pub bytes_covered: u64,
    pub bytes_uncovered: u64,
    /// `100 * covered / size`, 0 for an empty file.
    pub coverage_percentage: f64,
    /// Minimal merged mapped intervals, ascending.
    pub covered: Vec<Interval>,
    /// Unmapped intervals, ascending and disjoint.
    pub gaps: Vec<Interval>,
    /// Longest gap; ties break to the lower start offset.
    pub largest_gap: Option<Interval>,
    pub record_count: usize,
}

/// Compute coverage of `result` over a file of `file_size` bytes.
pub fn analyze(result: &ParseResult, file_size: u64) -> CoverageReport {
    let intervals = result
        .records
        .iter()
        .flat_map(|r| r.fields.iter())
        .filter(|f| f.error.is_none() && f.length > 0)
        .map(|f| (f.offset.min(file_size), (f.offset + f.length).min(file_size)))
        .filter(|(start, end)| end > start)
        .sorted()
        .collect::<Vec<_>>();

    // Merge overlapping or touching intervals.
    let mut covered: Vec<Interval> = Vec::new();
    for (start, end) in intervals {
        match covered.last_mut() {
            Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
            _ => covered.push((start, end)),
        }
    }

    let mut gaps = Vec::new();
    let mut pos = 0;
    for &(start, end) in &covered {
        if start > pos {
            gaps.push((pos, start));
        }
        pos = end;
    }
    if pos < file_size {
        gaps.push((pos, file_size));
    }

    let bytes_covered: u64 = covered.iter().map(|(s, e)| e - s).sum();
    let bytes_uncovered = file_size - bytes_covered;
    let coverage_percentage = if file_size == 0 {
        0.0
    } else {
        100.0 * bytes_covered as f64 / file_size as f64
    };
    let largest_gap = gaps
        .iter()
        .copied()
        .max_by_key(|&(s, e)| (e - s, std::cmp::Reverse(s)));

    CoverageReport {
        file_size,
        bytes_covered,
        bytes_uncovered,
        coverage_percentage,
        covered,
        gaps,
        largest_gap,
        record_count: result.records.len(),
    }
}
