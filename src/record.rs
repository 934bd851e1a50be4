//! The canonical in-memory working form the pipeline passes around (spec §3).
//!
//! The source project carries data in a pandas `DataFrame`. Nothing in this
//! crate's dependency stack (nor the teacher's, nor the other example repos)
//! reaches for a dataframe library, so the canonical frame here is a plain
//! row-oriented `Vec<Record>` with helper methods that mirror the pandas
//! operations the pipeline needs: dedup, reindex-to-grid, and merge with
//! last-write-wins semantics.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single row of the canonical frame: one instant, one station, one model,
/// and a sparse map of variable name -> value.
///
/// `model` is the empty string for observations (spec §3). Variable values
/// are `None` to represent either "not requested/known" or an explicit gap
/// marker recording upstream-confirmed absence -- the two cases are not
/// distinguished at this layer; the Query Manager is the one that knows
/// which rows are gap markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub datetime: DateTime<Utc>,
    pub station_id: String,
    #[serde(default)]
    pub model: String,
    pub variables: BTreeMap<String, Option<f64>>,
}

impl Record {
    pub fn new(datetime: DateTime<Utc>, station_id: impl Into<String>, model: impl Into<String>) -> Self {
        Record {
            datetime,
            station_id: station_id.into(),
            model: model.into(),
            variables: BTreeMap::new(),
        }
    }

    /// The composite key the pipeline's uniqueness invariant is defined over:
    /// `(station_id, model, datetime)`.
    pub fn key(&self) -> (String, String, DateTime<Utc>) {
        (self.station_id.clone(), self.model.clone(), self.datetime)
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Option<f64>) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// True if every variable value is `None` -- an explicit gap marker row
    /// ("upstream confirmed no data here", spec §3 / §4.4 step 8).
    pub fn is_gap_marker(&self) -> bool {
        !self.variables.is_empty() && self.variables.values().all(Option::is_none)
    }
}

/// An ordered collection of [`Record`]s with pipeline-stage invariants:
/// `(station_id, model, datetime)` unique within any single `Frame`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame(pub Vec<Record>);

impl Frame {
    pub fn new() -> Self {
        Frame(Vec::new())
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Frame(records)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<Record> {
        self.0
    }

    pub fn push(&mut self, record: Record) {
        self.0.push(record);
    }

    pub fn extend(&mut self, other: Frame) {
        self.0.extend(other.0);
    }

    pub fn sort_by_datetime(&mut self) {
        self.0.sort_by_key(|r| r.datetime);
    }

    /// Earliest/latest datetime in the frame, if any.
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if self.0.is_empty() {
            return None;
        }
        let min = self.0.iter().map(|r| r.datetime).min().unwrap();
        let max = self.0.iter().map(|r| r.datetime).max().unwrap();
        Some((min, max))
    }

    /// Drop duplicates on `(datetime, station_id, model)`, keeping the last
    /// occurrence in iteration order (mirrors
    /// `provider_data[~provider_data.index.duplicated(keep='last')]` in
    /// `original_source/src/query_manager.py::_fetch_missing_data`).
    pub fn dedup_keep_last(self) -> Frame {
        let mut by_key: HashMap<(String, String, DateTime<Utc>), Record> = HashMap::new();
        let mut order: Vec<(String, String, DateTime<Utc>)> = Vec::new();
        for record in self.0 {
            let key = record.key();
            if !by_key.contains_key(&key) {
                order.push(key.clone());
            }
            by_key.insert(key, record);
        }
        Frame(order.into_iter().filter_map(|k| by_key.remove(&k)).collect())
    }

    /// Reindex this frame's rows (assumed to all share one `(station_id,
    /// model)` pair) onto `grid`, filling any instant absent from the frame
    /// with an explicit gap-marker row carrying `expected_variables` all
    /// `None`. Mirrors `provider_data.reindex(gap_index)` plus the
    /// "add missing expected variable columns as NULL" step in spec §4.4.8.
    pub fn reindex_to_grid(
        self,
        station_id: &str,
        model: &str,
        grid: &[DateTime<Utc>],
        expected_variables: &[String],
    ) -> Frame {
        let mut by_datetime: HashMap<DateTime<Utc>, Record> =
            self.0.into_iter().map(|r| (r.datetime, r)).collect();

        let mut out = Vec::with_capacity(grid.len());
        for &instant in grid {
            let mut record = by_datetime
                .remove(&instant)
                .unwrap_or_else(|| Record::new(instant, station_id, model));
            for var in expected_variables {
                record.variables.entry(var.clone()).or_insert(None);
            }
            out.push(record);
        }
        Frame(out)
    }

    /// Merge `self` (older / cached) with `newer`, last-write-wins on
    /// `(station_id, model, datetime)`. Mirrors
    /// `pd.concat([existing, new]); drop_duplicates(keep='last')` in
    /// `query_manager.py::get_data`.
    pub fn merge_last_write_wins(self, newer: Frame) -> Frame {
        let mut by_key: HashMap<(String, String, DateTime<Utc>), Record> = HashMap::new();
        let mut order: Vec<(String, String, DateTime<Utc>)> = Vec::new();

        for record in self.0.into_iter().chain(newer.0.into_iter()) {
            let key = record.key();
            if !by_key.contains_key(&key) {
                order.push(key.clone());
            }
            by_key.insert(key, record);
        }

        let mut out: Vec<Record> = order.into_iter().filter_map(|k| by_key.remove(&k)).collect();
        out.sort_by_key(|r| r.datetime);
        Frame(out)
    }

    /// Distinct variable names present across every row of the frame.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for record in &self.0 {
            for key in record.variables.keys() {
                names.insert(key.clone());
            }
        }
        names.into_iter().collect()
    }

    /// Group rows by `(station_id, model)`, preserving first-seen group
    /// order. Used before per-group reindexing.
    pub fn group_by_station_model(self) -> Vec<((String, String), Vec<Record>)> {
        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<Record>> = HashMap::new();
        for record in self.0 {
            let key = (record.station_id.clone(), record.model.clone());
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(record);
        }
        order
            .into_iter()
            .map(|k| {
                let records = groups.remove(&k).unwrap_or_default();
                (k, records)
            })
            .collect()
    }
}

impl IntoIterator for Frame {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Record> for Frame {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Frame(iter.into_iter().collect())
    }
}

/// Metadata returned alongside a station's identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationInfo {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<f64>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn dedup_keeps_last() {
        let r1 = Record::new(ts(0, 0), "s1", "").with_variable("tair_2m", Some(1.0));
        let r2 = Record::new(ts(0, 0), "s1", "").with_variable("tair_2m", Some(2.0));
        let frame = Frame::from_records(vec![r1, r2]).dedup_keep_last();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.0[0].variables.get("tair_2m"), Some(&Some(2.0)));
    }

    #[test]
    fn reindex_fills_gap_markers() {
        let grid = vec![ts(0, 0), ts(0, 10), ts(0, 20)];
        let present = Record::new(ts(0, 10), "s1", "").with_variable("tair_2m", Some(5.0));
        let frame = Frame::from_records(vec![present]).reindex_to_grid(
            "s1",
            "",
            &grid,
            &["tair_2m".to_string()],
        );
        assert_eq!(frame.len(), 3);
        assert!(frame.0[0].is_gap_marker());
        assert_eq!(frame.0[1].variables.get("tair_2m"), Some(&Some(5.0)));
        assert!(frame.0[2].is_gap_marker());
    }

    #[test]
    fn merge_last_write_wins_prefers_newer() {
        let cached = Record::new(ts(0, 0), "s1", "").with_variable("tair_2m", Some(1.0));
        let fetched = Record::new(ts(0, 0), "s1", "").with_variable("tair_2m", Some(9.0));
        let merged = Frame::from_records(vec![cached])
            .merge_last_write_wins(Frame::from_records(vec![fetched]));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.0[0].variables.get("tair_2m"), Some(&Some(9.0)));
    }

    #[test]
    fn is_gap_marker_requires_nonempty_all_none() {
        let mut r = Record::new(ts(0, 0), "s1", "");
        assert!(!r.is_gap_marker());
        r.variables.insert("tair_2m".into(), None);
        assert!(r.is_gap_marker());
        r.variables.insert("precipitation".into(), Some(0.0));
        assert!(!r.is_gap_marker());
    }
}
