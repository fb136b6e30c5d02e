//! Stored row documents
//!
//! A row holds every cell of one series within one bucket. Data rows carry
//! `f64` values, annotation rows carry whole [`Annotation`](crate::Annotation)
//! records. Offsets are milliseconds from the bucket start; JSON encodes them
//! as decimal-text object keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store kind for data rows
pub const DATA_KIND: &str = "data";

/// Store kind for annotation rows
pub const ANNOTATION_KIND: &str = "annotation";

/// Sparse per-bucket row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row<V> {
    /// Flattened `[tagk_uid, tagv_uid, ...]`, fixed at creation
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "BTreeMap::new")]
    pub cells: BTreeMap<u32, V>,
}

impl<V> Row<V> {
    /// Create an empty row for the given sorted tag pairs
    pub fn new(pairs: &[(String, String)]) -> Self {
        Self {
            tags: pairs
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect(),
            cells: BTreeMap::new(),
        }
    }

    /// Set the cell at `offset`, replacing any previous value
    pub fn upsert(&mut self, offset: u32, value: V) {
        self.cells.insert(offset, value);
    }

    /// Cells whose offset lies in `[min, max]`, ascending
    pub fn cells_between(&self, min: u32, max: u32) -> impl Iterator<Item = (u32, &V)> {
        self.cells.range(min..=max).map(|(offset, v)| (*offset, v))
    }
}

/// Offset bounds of a query window inside one bucket.
///
/// Buckets strictly inside the window are unrestricted, the start bucket is
/// bounded below, the end bucket above, and a single-bucket window both.
pub fn offset_bounds(
    bucket: u32,
    (start_bucket, start_offset): (u32, u32),
    (end_bucket, end_offset): (u32, u32),
) -> (u32, u32) {
    let min = if bucket == start_bucket { start_offset } else { 0 };
    let max = if bucket == end_bucket { end_offset } else { u32::MAX };
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_json_uses_text_offsets() {
        let mut row: Row<f64> = Row::new(&[("000001".into(), "000002".into())]);
        row.upsert(8_400_000, 23.0);
        row.upsert(5, 1.5);
        row.upsert(5, 2.5);

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["tags"], serde_json::json!(["000001", "000002"]));
        assert_eq!(json["cells"]["8400000"], serde_json::json!(23.0));
        assert_eq!(json["cells"]["5"], serde_json::json!(2.5));

        let decoded: Row<f64> = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_offset_bounds() {
        let start = (10, 500);
        let end = (12, 100);
        assert_eq!(offset_bounds(10, start, end), (500, u32::MAX));
        assert_eq!(offset_bounds(11, start, end), (0, u32::MAX));
        assert_eq!(offset_bounds(12, start, end), (0, 100));
        assert_eq!(offset_bounds(10, (10, 5), (10, 9)), (5, 9));
    }

    #[test]
    fn test_cells_between() {
        let mut row: Row<f64> = Row::new(&[]);
        for offset in [1, 5, 9, 20] {
            row.upsert(offset, offset as f64);
        }
        let hits: Vec<_> = row.cells_between(5, 9).map(|(o, _)| o).collect();
        assert_eq!(hits, vec![5, 9]);
    }
}
