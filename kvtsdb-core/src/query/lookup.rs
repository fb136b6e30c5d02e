//! Series lookup by metric and tag predicates

use crate::codec::RowKeyCodec;
use crate::config::TsdbConfig;
use crate::row::DATA_KIND;
use crate::store::{scan_all, KeyRange, KvStore};
use crate::uid::UidRegistry;
use crate::{Result, SeriesDescriptor, TagPredicate, UidKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Finds series by walking data row keys
pub struct LookupEngine {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    registry: Arc<UidRegistry>,
    codec: RowKeyCodec,
}

/// A distinct series seen in the scan, still in uid form
struct Candidate {
    tsuid: String,
    metric_uid: String,
    pairs: Vec<(String, String)>,
}

impl LookupEngine {
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

    /// Series matching every predicate, in scan order.
    ///
    /// With a metric, only that metric's rows are scanned (an unknown metric
    /// is [`TsdbError::NotFound`](crate::TsdbError::NotFound)); without one
    /// the whole data space is. `limit` caps the number of rows scanned, not
    /// the number of series returned.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn lookup(
        &self,
        metric: Option<&str>,
        predicates: &[TagPredicate],
        limit: Option<usize>,
    ) -> Result<Vec<SeriesDescriptor>> {
        let (start, end) = match metric {
            Some(name) => {
                let uid = self.registry.resolve(UidKind::Metric, name).await?;
                self.codec.metric_range(&uid)?
            }
            None => (String::new(), None),
        };
        let range = KeyRange::new(self.config.namespace.as_str(), DATA_KIND, start, end);
        let records =
            scan_all(self.store.as_ref(), &range, self.config.scan_page_size, limit).await?;
        let scanned = records.len();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for record in records {
            let key = self.codec.decode_row_key(&record.key.name)?;
            let tsuid = key.tsuid();
            if !seen.insert(tsuid.clone()) {
                continue;
            }
            let pairs = self.codec.split_tag_uids(&key.tag_uids)?;
            candidates.push(Candidate {
                tsuid,
                metric_uid: key.metric_uid,
                pairs,
            });
        }

        let descriptors = self.resolve(candidates).await?;
        let matched: Vec<SeriesDescriptor> = descriptors
            .into_iter()
            .filter(|d| predicates.iter().all(|p| p.matches(&d.tags)))
            .collect();

        debug!(
            "Lookup scanned {} rows, {} series matched",
            scanned,
            matched.len()
        );
        Ok(matched)
    }

    async fn resolve(&self, candidates: Vec<Candidate>) -> Result<Vec<SeriesDescriptor>> {
        let mut metric_uids = BTreeSet::new();
        let mut tagk_uids = BTreeSet::new();
        let mut tagv_uids = BTreeSet::new();
        for candidate in &candidates {
            metric_uids.insert(candidate.metric_uid.clone());
            for (k, v) in &candidate.pairs {
                tagk_uids.insert(k.clone());
                tagv_uids.insert(v.clone());
            }
        }

        let metrics = self.resolve_all(UidKind::Metric, metric_uids).await?;
        let tagks = self.resolve_all(UidKind::Tagk, tagk_uids).await?;
        let tagvs = self.resolve_all(UidKind::Tagv, tagv_uids).await?;

        Ok(candidates
            .into_iter()
            .map(|c| {
                let tags = c
                    .pairs
                    .iter()
                    .filter_map(|(k, v)| Some((tagks.get(k)?.clone(), tagvs.get(v)?.clone())))
                    .collect();
                SeriesDescriptor {
                    metric: metrics.get(&c.metric_uid).cloned().unwrap_or_default(),
                    tsuid: c.tsuid,
                    tags,
                }
            })
            .collect())
    }

    /// uid -> name for a set of uids, failing on any unknown uid
    async fn resolve_all(
        &self,
        kind: UidKind,
        uids: BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        let uids: Vec<String> = uids.into_iter().collect();
        let found = self
            .registry
            .resolve_many(kind, &uids)
            .await?
            .into_complete()?;
        Ok(found
            .into_iter()
            .map(|(uid, meta)| (uid, meta.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::writer::PointWriter;
    use crate::{Point, TsdbError};

    async fn engine() -> LookupEngine {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new().with_max_page_size(2));
        let config = Arc::new(TsdbConfig::default());
        let registry = Arc::new(UidRegistry::new(store.clone(), config.clone()));
        let writer = PointWriter::new(store.clone(), config.clone(), registry.clone());

        let t0 = 1524450000;
        let points = vec![
            Point::new("cpu", t0, 1.0).with_tag("host", "a").with_tag("type", "user"),
            Point::new("cpu", t0 + 86_400, 1.0).with_tag("host", "a").with_tag("type", "user"),
            Point::new("cpu", t0, 1.0).with_tag("host", "b").with_tag("type", "system"),
            Point::new("disk", t0, 1.0).with_tag("host", "a").with_tag("dev", "sda"),
            Point::new("mem", t0, 1.0),
        ];
        for result in writer.store_points(&points).await {
            result.unwrap();
        }
        LookupEngine::new(store, config, registry)
    }

    fn preds(raw: &[&str]) -> Vec<TagPredicate> {
        raw.iter().map(|p| TagPredicate::parse(p).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_lookup_metric_dedups_series() {
        let engine = engine().await;
        let found = engine.lookup(Some("cpu"), &[], None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|d| d.metric == "cpu"));
        assert_eq!(found[0].tags.get("host").map(String::as_str), Some("a"));
        assert_eq!(found[1].tags.get("host").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn test_lookup_predicates() {
        let engine = engine().await;

        let exact = engine.lookup(None, &preds(&["host=a"]), None).await.unwrap();
        let metrics: Vec<_> = exact.iter().map(|d| d.metric.as_str()).collect();
        assert_eq!(metrics, vec!["cpu", "disk"]);

        let any_value = engine.lookup(None, &preds(&["dev=*"]), None).await.unwrap();
        assert_eq!(any_value.len(), 1);
        assert_eq!(any_value[0].metric, "disk");

        let any_key = engine.lookup(None, &preds(&["*=system"]), None).await.unwrap();
        assert_eq!(any_key.len(), 1);
        assert_eq!(any_key[0].tags.get("host").map(String::as_str), Some("b"));

        let both = engine
            .lookup(Some("cpu"), &preds(&["host=a", "type=*"]), None)
            .await
            .unwrap();
        assert_eq!(both.len(), 1);

        let none = engine
            .lookup(Some("cpu"), &preds(&["host=a", "*=system"]), None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_limit_bounds_scanned_rows() {
        let engine = engine().await;
        let found = engine.lookup(Some("cpu"), &[], Some(1)).await.unwrap();
        assert_eq!(found.len(), 1);

        // three rows, the third repeats the first series in the next bucket
        let found = engine.lookup(Some("cpu"), &[], Some(3)).await.unwrap();
        assert_eq!(found.len(), 2);

        let all = engine.lookup(None, &[], None).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_lookup_unknown_metric() {
        let engine = engine().await;
        assert!(matches!(
            engine.lookup(Some("nope"), &[], None).await,
            Err(TsdbError::NotFound { .. })
        ));
    }
}
