//! Write path: points and annotations into bucketed rows
//!
//! Every element of a batch is written independently. One element's failure
//! is reported at its position and never stops the rest of the batch.

mod annotation;

pub use annotation::AnnotationWriter;

use crate::codec::{bucket_of, RowKeyCodec};
use crate::config::TsdbConfig;
use crate::retry::{run_with_retry, Attempt};
use crate::row::{Row, DATA_KIND};
use crate::store::{decode_doc, encode_doc, Key, KvStore};
use crate::uid::UidRegistry;
use crate::{Point, Result, TsdbError, UidKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Per-element batch outcome
pub type WriteResult = std::result::Result<(), String>;

/// Writes data points, assigning uids on first sight
pub struct PointWriter {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    registry: Arc<UidRegistry>,
    codec: RowKeyCodec,
}

impl PointWriter {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: Arc<TsdbConfig>,
        registry: Arc<UidRegistry>,
    ) -> Self {
        let codec = RowKeyCodec::new(&config);
        Self {
            store,
            config,
            registry,
            codec,
        }
    }

    /// Store a batch of points, one result per point in input order
    pub async fn store_points(&self, points: &[Point]) -> Vec<WriteResult> {
        let mut results = Vec::with_capacity(points.len());
        for point in points {
            let result = self.store_point(point).await.map_err(|e| {
                warn!("Failed to store point for {}: {}", point.metric, e);
                e.to_string()
            });
            results.push(result);
        }
        results
    }

    /// Store one point.
    ///
    /// A commit conflict replays uid resolution and the row upsert in a fresh
    /// transaction, up to the configured attempt bound.
    #[tracing::instrument(level = "trace", skip_all, fields(metric = %point.metric))]
    pub async fn store_point(&self, point: &Point) -> Result<()> {
        validate_point(point)?;
        let (bucket, offset) = bucket_of(point.timestamp)?;
        run_with_retry(&self.config.retry, "point write", || {
            self.try_store(point, bucket, offset)
        })
        .await
    }

    async fn try_store(&self, point: &Point, bucket: u32, offset: u32) -> Result<Attempt<()>> {
        let metric_uid = self
            .registry
            .assign_if_absent(UidKind::Metric, &point.metric)
            .await?;
        let pairs = self.assign_tags(point).await?;

        let row_key = self.codec.encode_row_key(
            &metric_uid,
            bucket,
            &RowKeyCodec::join_tag_uids(&pairs),
        );
        let key = Key::new(self.config.namespace.as_str(), DATA_KIND, row_key);
        upsert_cell(self.store.as_ref(), key, &pairs, offset, &point.value).await
    }

    /// Assign uids for every tag, sorted by tag key uid
    async fn assign_tags(&self, point: &Point) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::with_capacity(point.tags.len());
        for (tagk, tagv) in &point.tags {
            let tagk_uid = self.registry.assign_if_absent(UidKind::Tagk, tagk).await?;
            let tagv_uid = self.registry.assign_if_absent(UidKind::Tagv, tagv).await?;
            pairs.push((tagk_uid, tagv_uid));
        }
        pairs.sort();
        Ok(pairs)
    }
}

fn validate_point(point: &Point) -> Result<()> {
    if point.metric.is_empty() {
        return Err(TsdbError::InvalidInput("Point has an empty metric".into()));
    }
    if !point.value.is_finite() {
        return Err(TsdbError::InvalidInput(format!(
            "Point value {} is not finite",
            point.value
        )));
    }
    if let Some((k, v)) = point
        .tags
        .iter()
        .find(|(k, v)| k.is_empty() || v.is_empty())
    {
        return Err(TsdbError::InvalidInput(format!(
            "Empty tag key or value in '{}={}'",
            k, v
        )));
    }
    Ok(())
}

/// Read-modify-write one cell of a row in a single transaction.
///
/// A missing row is created with `pairs` as its immutable tag list; an
/// existing row keeps the tag list it was created with.
pub(crate) async fn upsert_cell<V>(
    store: &dyn KvStore,
    key: Key,
    pairs: &[(String, String)],
    offset: u32,
    value: &V,
) -> Result<Attempt<()>>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    let mut txn = store.begin().await?;
    let mut row: Row<V> = match txn.get(&key).await? {
        Some(bytes) => decode_doc(&key, &bytes)?,
        None => Row::new(pairs),
    };
    row.upsert(offset, value.clone());
    txn.put(key, encode_doc(&row)?);
    let outcome = txn.commit().await?;
    Ok(Attempt::from_commit(outcome, ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn writer() -> (MemoryStore, PointWriter) {
        let store = MemoryStore::new();
        let config = Arc::new(TsdbConfig::default());
        let shared: Arc<dyn KvStore> = Arc::new(store.clone());
        let registry = Arc::new(UidRegistry::new(shared.clone(), config.clone()));
        (store, PointWriter::new(shared, config, registry))
    }

    async fn row(store: &MemoryStore, name: &str) -> Option<Row<f64>> {
        let key = Key::new("default", DATA_KIND, name);
        store
            .get(&key)
            .await
            .unwrap()
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_point_lands_in_bucket_row() {
        let (store, writer) = writer();
        let point = Point::new("cpu.percent", 1524450000, 23.0)
            .with_tag("host", "host001")
            .with_tag("type", "user");
        writer.store_point(&point).await.unwrap();

        let row = row(&store, "00000144ec000001000001000002000002").await.unwrap();
        assert_eq!(row.tags, vec!["000001", "000001", "000002", "000002"]);
        assert_eq!(row.cells.get(&8_400_000), Some(&23.0));
    }

    #[tokio::test]
    async fn test_same_offset_last_write_wins() {
        let (store, writer) = writer();
        let first = Point::new("m", 1524450000, 1.0).with_tag("h", "a");
        let second = Point::new("m", 1524450000, 2.0).with_tag("h", "a");
        let later = Point::new("m", 1524450001, 3.0).with_tag("h", "a");
        writer.store_points(&[first, second, later]).await;

        let row = row(&store, "00000144ec000001000001").await.unwrap();
        assert_eq!(row.cells.len(), 2);
        assert_eq!(row.cells.get(&8_400_000), Some(&2.0));
        assert_eq!(row.cells.get(&8_401_000), Some(&3.0));
    }

    #[tokio::test]
    async fn test_batch_reports_failures_positionally() {
        let (_, writer) = writer();
        let points = vec![
            Point::new("ok", 1524450000, 1.0),
            Point::new("", 1524450000, 1.0),
            Point::new("nan", 1524450000, f64::NAN),
            Point::new("tag", 1524450000, 1.0).with_tag("host", ""),
            Point::new("neg", -5, 1.0),
            Point::new("ok", 1524450001, 2.0),
        ];
        let results = writer.store_points(&points).await;
        assert_eq!(results.len(), 6);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().contains("empty metric"));
        assert!(results[2].is_err());
        assert!(results[3].is_err());
        assert!(results[4].is_err());
        assert!(results[5].is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_points() {
        let (store, writer) = writer();
        store.set_available(false);
        let results = writer
            .store_points(&[Point::new("m", 1524450000, 1.0)])
            .await;
        assert!(results[0].as_ref().unwrap_err().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_row_tags_are_not_rewritten() {
        let (store, _writer) = writer();
        let key = Key::new("default", DATA_KIND, "0000010000");
        let pairs = vec![("0000aa".to_string(), "0000bb".to_string())];
        upsert_cell(&store, key.clone(), &pairs, 1, &1.0).await.unwrap();
        upsert_cell(&store, key, &[], 2, &2.0).await.unwrap();

        let row = row(&store, "0000010000").await.unwrap();
        assert_eq!(row.tags, vec!["0000aa", "0000bb"]);
        assert_eq!(row.cells.len(), 2);
    }
}
