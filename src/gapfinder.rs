//! Gap Finder (spec §4.2): given the timestamps already present in the
//! cache and the requested range, compute the minimal list of contiguous
//! sub-ranges missing from the canonical grid.
//!
//! Ported from `original_source/src/gapfinder.py::Gapfinder.find_data_gaps`
//! and `derive_datetime_gaps`, using `chrono::Duration` arithmetic in place
//! of pandas offsets.

use chrono::{DateTime, TimeZone, Utc};

use crate::frequency::{parse_freq, Inclusive};

/// Floor `dt` to the nearest multiple of `freq` since the Unix epoch.
/// Mirrors `pd.Timestamp(dt).floor(freq)`.
pub fn floor_to_freq(dt: DateTime<Utc>, freq: chrono::Duration) -> DateTime<Utc> {
    let freq_secs = freq.num_seconds().max(1);
    let epoch_secs = dt.timestamp();
    let floored = epoch_secs - epoch_secs.rem_euclid(freq_secs);
    Utc.timestamp_opt(floored, 0).unwrap()
}

/// Build the ordered canonical grid of instants in `[start, end]` (floored
/// to `freq` first) stepped by `freq`, honoring `inclusive`.
pub fn build_grid(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: chrono::Duration,
    inclusive: Inclusive,
) -> Vec<DateTime<Utc>> {
    let start_aligned = floor_to_freq(start, freq);
    let end_aligned = floor_to_freq(end, freq);

    if end_aligned < start_aligned {
        return vec![];
    }

    let mut grid = Vec::new();
    let mut t = start_aligned;
    while t <= end_aligned {
        grid.push(t);
        t += freq;
    }

    match inclusive {
        Inclusive::Both => grid,
        Inclusive::Left => {
            grid.pop();
            grid
        }
        Inclusive::Right => {
            if !grid.is_empty() {
                grid.remove(0);
            }
            grid
        }
    }
}

/// Group a sorted-or-unsorted list of missing timestamps into consecutive
/// runs at the given frequency. Mirrors `derive_datetime_gaps`.
fn coalesce_runs(
    timestamps: &[DateTime<Utc>],
    freq: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if timestamps.is_empty() {
        return vec![];
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let mut gaps = Vec::new();
    let mut gap_start = sorted[0];
    let mut gap_end = sorted[0];

    for &current in &sorted[1..] {
        let expected_next = gap_end + freq;
        if current == expected_next {
            gap_end = current;
        } else {
            gaps.push((gap_start, gap_end));
            gap_start = current;
            gap_end = current;
        }
    }
    gaps.push((gap_start, gap_end));
    gaps
}

/// Find the minimal list of `[gap_start, gap_end]` intervals missing from
/// `existing_instants` over `[start, end]` at `freq`, coalescing anything
/// shorter than `min_gap_duration` away. On any internal failure (currently
/// only a bad frequency string) falls back to returning the whole requested
/// range as a single gap -- never silently returns no gaps on error (spec
/// §4.2).
pub fn find_gaps(
    existing_instants: &[DateTime<Utc>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: &str,
    inclusive: Inclusive,
    min_gap_duration: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    match find_gaps_inner(existing_instants, start, end, freq, inclusive, min_gap_duration) {
        Ok(gaps) => gaps,
        Err(_) => vec![(start, end)],
    }
}

fn find_gaps_inner(
    existing_instants: &[DateTime<Utc>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: &str,
    inclusive: Inclusive,
    min_gap_duration: chrono::Duration,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, crate::error::MeteoError> {
    let freq_delta = parse_freq(freq)?;

    let grid = build_grid(start, end, freq_delta, inclusive);
    if grid.is_empty() {
        return Ok(vec![]);
    }

    if existing_instants.is_empty() {
        return Ok(vec![(grid[0], *grid.last().unwrap())]);
    }

    let existing: std::collections::BTreeSet<DateTime<Utc>> =
        existing_instants.iter().cloned().collect();

    let missing: Vec<DateTime<Utc>> = grid.into_iter().filter(|t| !existing.contains(t)).collect();

    if missing.is_empty() {
        return Ok(vec![]);
    }

    let mut gaps = Vec::new();
    for (gap_start, gap_end) in coalesce_runs(&missing, freq_delta) {
        let coverage = (gap_end + freq_delta) - gap_start;
        if coverage >= min_gap_duration {
            gaps.push((gap_start, gap_end));
        }
    }

    Ok(gaps)
}

/// Default minimum gap duration (30 min, spec §4.2) that prevents thrashing
/// the upstream with single-sample fetches.
pub fn default_min_gap_duration() -> chrono::Duration {
    chrono::Duration::minutes(30)
}
