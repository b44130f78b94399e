//! Calendar chunking of the run's time range.

use super::TemporalChunk;
use crate::extent::TimeRange;
use chrono::{Datelike, NaiveDate};

/// Split a time range at calendar boundaries.
///
/// Boundaries strictly inside the range become chunk edges, so the first and
/// last chunks may be ragged (e.g. 2020-03-15..2021-01-01 for a per-year
/// chunking of a range starting mid-March). Chunks are returned in
/// chronological order and tile the range exactly.
pub fn chunk_time_range(range: &TimeRange, chunk: TemporalChunk) -> Vec<TimeRange> {
    let boundaries: Vec<NaiveDate> = match chunk {
        TemporalChunk::Whole => Vec::new(),
        TemporalChunk::Year => year_starts(range),
        TemporalChunk::Month => month_starts(range),
    };

    let mut edges = Vec::with_capacity(boundaries.len() + 2);
    edges.push(range.start);
    edges.extend(boundaries);
    edges.push(range.end);

    edges
        .windows(2)
        .filter(|w| w[0] < w[1])
        .map(|w| TimeRange {
            start: w[0],
            end: w[1],
        })
        .collect()
}

fn year_starts(range: &TimeRange) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    for year in range.start.year()..=range.end.year() {
        let d = NaiveDate::from_ymd_opt(year, 1, 1).expect("jan 1 is always valid");
        if d > range.start && d < range.end {
            out.push(d);
        }
    }
    out
}

fn month_starts(range: &TimeRange) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut year = range.start.year();
    let mut month = range.start.month();
    loop {
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
        let d = NaiveDate::from_ymd_opt(year, month, 1).expect("first of month is always valid");
        if d >= range.end {
            break;
        }
        if d > range.start {
            out.push(d);
        }
    }
    out
}
