//! Per-document record series, sorted by timestamp.
//!
//! All positional queries are binary searches; timestamps are unique
//! within a series, so insert at an existing timestamp replaces the
//! record in place.

use crate::record::Record;

/// A strictly time-ordered sequence of records for one document.
#[derive(Debug, Default)]
pub struct DocumentSeries {
    records: Vec<Record>,
}

impl DocumentSeries {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Upsert: insert at the sorted position, or replace the record that
    /// already carries this timestamp. Replacement overwrites payload and
    /// dirty flag; it is the only mutation of an occupied slot.
    pub fn insert(&mut self, record: Record) {
        match self.records.binary_search_by(|r| r.ts.cmp(&record.ts)) {
            Ok(i) => self.records[i] = record,
            Err(i) => self.records.insert(i, record),
        }
    }

    /// Index of the greatest record with `ts <= pivot`.
    pub fn latest_index(&self, pivot: i64) -> Option<usize> {
        let upper = self.records.partition_point(|r| r.ts <= pivot);
        if upper == 0 {
            None
        } else {
            Some(upper - 1)
        }
    }

    /// Index of the smallest record with `ts >= pivot`.
    pub fn earliest_index(&self, pivot: i64) -> Option<usize> {
        let lower = self.records.partition_point(|r| r.ts < pivot);
        if lower == self.records.len() {
            None
        } else {
            Some(lower)
        }
    }

    /// The greatest record with `ts <= pivot`, if any.
    pub fn latest(&self, pivot: i64) -> Option<&Record> {
        self.latest_index(pivot).map(|i| &self.records[i])
    }

    /// The smallest record with `ts >= pivot`, if any.
    pub fn earliest(&self, pivot: i64) -> Option<&Record> {
        self.earliest_index(pivot).map(|i| &self.records[i])
    }

    /// All records in the inclusive window `[from, to]`.
    pub fn range(&self, from: i64, to: i64) -> &[Record] {
        if from > to {
            return &[];
        }
        let lower = self.records.partition_point(|r| r.ts < from);
        let upper = self.records.partition_point(|r| r.ts <= to);
        &self.records[lower..upper]
    }

    /// Delete the record at exactly `ts`. Returns whether one was removed.
    pub fn delete_at(&mut self, ts: i64) -> bool {
        match self.records.binary_search_by(|r| r.ts.cmp(&ts)) {
            Ok(i) => {
                self.records.remove(i);
                self.maybe_compact();
                true
            }
            Err(_) => false,
        }
    }

    /// Delete every record in the inclusive window `[from, to]`.
    /// Returns how many were removed.
    pub fn delete_range(&mut self, from: i64, to: i64) -> usize {
        if from > to {
            return 0;
        }
        let lower = self.records.partition_point(|r| r.ts < from);
        let upper = self.records.partition_point(|r| r.ts <= to);
        if lower >= upper {
            return 0;
        }
        let removed = upper - lower;
        self.records.drain(lower..upper);
        self.maybe_compact();
        removed
    }

    /// Clear every dirty flag (called after a successful flush wrote
    /// the dirty records out).
    pub fn mark_clean(&mut self) {
        for record in &mut self.records {
            record.dirty = false;
        }
    }

    /// Memory hint: rebuild to exact size once deletions leave the
    /// backing capacity more than twice the length.
    fn maybe_compact(&mut self) {
        if self.records.capacity() > self.records.len() * 2 {
            self.records.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_of(timestamps: &[i64]) -> DocumentSeries {
        let mut series = DocumentSeries::new();
        for &ts in timestamps {
            series.insert(Record::new(ts, format!("v{ts}")));
        }
        series
    }

    #[test]
    fn test_insert_keeps_strict_order() {
        let series = series_of(&[30, 10, 20, 50, 40]);
        let timestamps: Vec<i64> = series.records().iter().map(|r| r.ts).collect();
        assert_eq!(timestamps, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_insert_same_timestamp_replaces() {
        let mut series = series_of(&[10, 20]);
        series.insert(Record::new(10, "replaced"));

        assert_eq!(series.len(), 2, "replacement must not grow the series");
        assert_eq!(series.records()[0].data, "replaced");
        assert!(series.records()[0].dirty);
    }

    #[test]
    fn test_latest_index_pivot_inclusive() {
        let series = series_of(&[10, 20, 30]);
        assert_eq!(series.latest_index(30), Some(2));
        assert_eq!(series.latest_index(25), Some(1));
        assert_eq!(series.latest_index(10), Some(0));
        assert_eq!(series.latest_index(9), None);
        assert_eq!(series.latest_index(1000), Some(2));
    }

    #[test]
    fn test_earliest_index_pivot_inclusive() {
        let series = series_of(&[10, 20, 30]);
        assert_eq!(series.earliest_index(10), Some(0));
        assert_eq!(series.earliest_index(11), Some(1));
        assert_eq!(series.earliest_index(30), Some(2));
        assert_eq!(series.earliest_index(31), None);
        assert_eq!(series.earliest_index(0), Some(0));
    }

    #[test]
    fn test_empty_series_lookups() {
        let series = DocumentSeries::new();
        assert_eq!(series.latest_index(100), None);
        assert_eq!(series.earliest_index(0), None);
        assert!(series.range(0, 100).is_empty());
    }

    #[test]
    fn test_range_inclusive_both_ends() {
        let series = series_of(&[10, 20, 30, 40]);
        let window: Vec<i64> = series.range(20, 30).iter().map(|r| r.ts).collect();
        assert_eq!(window, vec![20, 30]);

        let all: Vec<i64> = series.range(0, 100).iter().map(|r| r.ts).collect();
        assert_eq!(all, vec![10, 20, 30, 40]);

        assert!(series.range(11, 19).is_empty());
        assert!(series.range(50, 10).is_empty(), "inverted window is empty");
    }

    #[test]
    fn test_delete_at_exact_match_only() {
        let mut series = series_of(&[10, 20, 30]);
        assert!(!series.delete_at(15));
        assert_eq!(series.len(), 3);

        assert!(series.delete_at(20));
        let timestamps: Vec<i64> = series.records().iter().map(|r| r.ts).collect();
        assert_eq!(timestamps, vec![10, 30]);
    }

    #[test]
    fn test_delete_range_inclusive() {
        let mut series = series_of(&[10, 20, 30, 40, 50]);
        assert_eq!(series.delete_range(20, 40), 3);
        let timestamps: Vec<i64> = series.records().iter().map(|r| r.ts).collect();
        assert_eq!(timestamps, vec![10, 50]);

        assert_eq!(series.delete_range(100, 200), 0);
        assert_eq!(series.delete_range(50, 10), 0);
    }

    #[test]
    fn test_delete_range_entire_series() {
        let mut series = series_of(&[10, 20, 30]);
        assert_eq!(series.delete_range(0, 100), 3);
        assert!(series.is_empty());
    }

    #[test]
    fn test_mark_clean() {
        let mut series = series_of(&[10, 20]);
        assert!(series.records().iter().all(|r| r.dirty));
        series.mark_clean();
        assert!(series.records().iter().all(|r| !r.dirty));
    }

    #[test]
    fn test_order_invariant_under_random_workload() {
        let mut series = DocumentSeries::new();
        // Deterministic pseudo-random insert/delete mix.
        let mut x: i64 = 7;
        for _ in 0..500 {
            x = (x * 1103515245 + 12345) % 1000;
            if x % 5 == 0 {
                series.delete_at(x.abs() + 1);
            } else {
                series.insert(Record::new(x.abs() + 1, "v"));
            }
        }
        let timestamps: Vec<i64> = series.records().iter().map(|r| r.ts).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(timestamps, sorted, "series must stay strictly increasing");
    }
}
