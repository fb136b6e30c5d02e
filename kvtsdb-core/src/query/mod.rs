//! Read path: range queries, annotation windows and lookup
//!
//! A range query scans the contiguous key range covering every bucket the
//! window touches, trims the first and last buckets to the exact window,
//! regroups rows by tag signature (the same series reappears once per
//! bucket) and resolves uids back to names in one batch per kind.

mod lookup;

pub use lookup::LookupEngine;

use crate::codec::{bucket_of, normalize_timestamp, timestamp_of, RowKeyCodec};
use crate::config::TsdbConfig;
use crate::row::{offset_bounds, Row, ANNOTATION_KIND, DATA_KIND};
use crate::store::{decode_doc, scan_all, KeyRange, KvStore, Record};
use crate::uid::UidRegistry;
use crate::{Annotation, Result, Series, Timestamp, TsdbError, UidKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// A query window resolved to bucket coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// `(bucket, offset)` of the first included instant
    pub start: (u32, u32),
    /// `(bucket, offset)` of the last included instant
    pub end: (u32, u32),
}

impl TimeWindow {
    /// Resolve an inclusive window, normalizing seconds to milliseconds
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self> {
        let (start_ms, end_ms) = (normalize_timestamp(start)?, normalize_timestamp(end)?);
        if end_ms < start_ms {
            return Err(TsdbError::InvalidInput(format!(
                "Query end {} is before start {}",
                end, start
            )));
        }
        Ok(Self {
            start: bucket_of(start)?,
            end: bucket_of(end)?,
        })
    }

    /// Inclusive offset bounds applying to one bucket of the window
    pub fn bounds(&self, bucket: u32) -> (u32, u32) {
        offset_bounds(bucket, self.start, self.end)
    }
}

/// Rows of one tag signature accumulated across buckets
struct SeriesGroup {
    tag_uids: String,
    dps: Vec<(i64, f64)>,
}

/// Range and annotation query engine
pub struct RangeQueryEngine {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    registry: Arc<UidRegistry>,
    codec: RowKeyCodec,
}

impl RangeQueryEngine {
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

    /// Every series of `metric` with its points in `[start, end]`.
    ///
    /// Series appear in the order their tag signature is first seen in the
    /// scan; points within a series are ascending. An unknown metric is
    /// [`TsdbError::NotFound`]; a known metric without points in the window
    /// yields an empty list.
    #[tracing::instrument(level = "trace", skip_all, fields(metric = %metric))]
    pub async fn query_range(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Series>> {
        let timer = Instant::now();
        let metric_uid = self.registry.resolve(UidKind::Metric, metric).await?;
        let window = TimeWindow::new(start, end)?;
        let records = self.scan_window(DATA_KIND, &metric_uid, &window).await?;
        let row_count = records.len();

        let mut groups: Vec<SeriesGroup> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for record in records {
            let key = self.codec.decode_row_key(&record.key.name)?;
            let row: Row<f64> = decode_doc(&record.key, &record.value)?;
            let (min, max) = window.bounds(key.bucket);

            let mut cells = row.cells_between(min, max).peekable();
            if cells.peek().is_none() {
                continue;
            }
            let slot = *index.entry(key.tag_uids.clone()).or_insert_with(|| {
                groups.push(SeriesGroup {
                    tag_uids: key.tag_uids.clone(),
                    dps: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot]
                .dps
                .extend(cells.map(|(offset, v)| (timestamp_of(key.bucket, offset), *v)));
        }

        let series = self.resolve_series(metric, &metric_uid, groups).await?;
        debug!(
            "Query {} scanned {} rows into {} series in {:.2}ms",
            metric,
            row_count,
            series.len(),
            timer.elapsed().as_secs_f64() * 1000.0
        );
        Ok(series)
    }

    /// Turn tag signatures into named series with one batch lookup per kind
    async fn resolve_series(
        &self,
        metric: &str,
        metric_uid: &str,
        groups: Vec<SeriesGroup>,
    ) -> Result<Vec<Series>> {
        let mut split = Vec::with_capacity(groups.len());
        let mut tagk_uids = BTreeSet::new();
        let mut tagv_uids = BTreeSet::new();
        for group in groups {
            let pairs = self.codec.split_tag_uids(&group.tag_uids)?;
            for (k, v) in &pairs {
                tagk_uids.insert(k.clone());
                tagv_uids.insert(v.clone());
            }
            split.push((group, pairs));
        }

        let tagk_uids: Vec<String> = tagk_uids.into_iter().collect();
        let tagv_uids: Vec<String> = tagv_uids.into_iter().collect();
        let tagks = self
            .registry
            .resolve_many(UidKind::Tagk, &tagk_uids)
            .await?
            .into_complete()?;
        let tagvs = self
            .registry
            .resolve_many(UidKind::Tagv, &tagv_uids)
            .await?
            .into_complete()?;

        let mut series = Vec::with_capacity(split.len());
        for (group, pairs) in split {
            let mut tags = BTreeMap::new();
            for (k, v) in &pairs {
                if let (Some(k), Some(v)) = (tagks.get(k), tagvs.get(v)) {
                    tags.insert(k.name.clone(), v.name.clone());
                }
            }
            series.push(Series {
                metric: metric.to_string(),
                metric_uid: metric_uid.to_string(),
                tags,
                tsuid: format!("{}{}", metric_uid, group.tag_uids),
                dps: group.dps,
            });
        }
        Ok(series)
    }

    /// Annotations of each series in `tsuids` within `[start, end]`.
    ///
    /// Results follow `tsuids` order, then start time. Global annotations
    /// are never returned here.
    #[tracing::instrument(level = "trace", skip_all, fields(count = tsuids.len()))]
    pub async fn query_annotations(
        &self,
        tsuids: &[String],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Annotation>> {
        let window = TimeWindow::new(start, end)?;
        let global = self.codec.global_metric_uid();
        let mut annotations = Vec::new();
        for tsuid in tsuids {
            let (metric_uid, pairs) = self.codec.decompose_tsuid(tsuid)?;
            if metric_uid == global {
                return Err(TsdbError::InvalidInput(format!(
                    "Tsuid {} uses the reserved global metric uid",
                    tsuid
                )));
            }
            let tag_uids = RowKeyCodec::join_tag_uids(&pairs);
            annotations.extend(
                self.annotations_of(&metric_uid, &tag_uids, &window)
                    .await?,
            );
        }
        Ok(annotations)
    }

    /// Global annotations within `[start, end]`, by start time
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn query_global_annotations(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Annotation>> {
        let window = TimeWindow::new(start, end)?;
        let global = self.codec.global_metric_uid();
        self.annotations_of(&global, "", &window).await
    }

    async fn annotations_of(
        &self,
        metric_uid: &str,
        tag_uids: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Annotation>> {
        let records = self.scan_window(ANNOTATION_KIND, metric_uid, window).await?;
        let mut annotations = Vec::new();
        for record in records {
            let key = self.codec.decode_row_key(&record.key.name)?;
            if key.tag_uids != tag_uids {
                continue;
            }
            let row: Row<Annotation> = decode_doc(&record.key, &record.value)?;
            let (min, max) = window.bounds(key.bucket);
            annotations.extend(row.cells_between(min, max).map(|(_, a)| a.clone()));
        }
        Ok(annotations)
    }

    /// All rows of `metric_uid` in `kind` whose bucket the window touches
    async fn scan_window(
        &self,
        kind: &str,
        metric_uid: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Record>> {
        let (start, end) = self
            .codec
            .bucket_range(metric_uid, window.start.0, window.end.0)?;
        let range = KeyRange::new(self.config.namespace.as_str(), kind, start, end);
        scan_all(self.store.as_ref(), &range, self.config.scan_page_size, None).await
    }
}
