//! Annotation writer

use super::{upsert_cell, WriteResult};
use crate::codec::{bucket_of, RowKeyCodec};
use crate::config::TsdbConfig;
use crate::retry::run_with_retry;
use crate::row::ANNOTATION_KIND;
use crate::store::{Key, KvStore};
use crate::{Annotation, Result, TsdbError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stores annotation records in the annotation row space.
///
/// Series annotations go to the row of their tsuid; annotations without a
/// tsuid (or with `"0"`) go to the global row, keyed by the all-zero metric
/// uid and no tags.
pub struct AnnotationWriter {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    codec: RowKeyCodec,
}

impl AnnotationWriter {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<TsdbConfig>) -> Self {
        let codec = RowKeyCodec::new(&config);
        Self {
            store,
            config,
            codec,
        }
    }

    /// Store a batch of annotations, one result per annotation in input order
    pub async fn store_annotations(&self, annotations: &[Annotation]) -> Vec<WriteResult> {
        let mut results = Vec::with_capacity(annotations.len());
        for annotation in annotations {
            let result = self.store_annotation(annotation).await.map_err(|e| {
                warn!("Failed to store annotation: {}", e);
                e.to_string()
            });
            results.push(result);
        }
        results
    }

    /// Store one annotation at its start time, replacing any annotation
    /// already stored at that instant for the same series
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn store_annotation(&self, annotation: &Annotation) -> Result<()> {
        if let Some(end) = annotation.end_time {
            if end < annotation.start_time {
                return Err(TsdbError::InvalidInput(format!(
                    "Annotation ends ({}) before it starts ({})",
                    end, annotation.start_time
                )));
            }
        }
        let (metric_uid, pairs) = self.series_of(annotation)?;
        let (bucket, offset) = bucket_of(annotation.start_time)?;
        let row_key =
            self.codec
                .encode_row_key(&metric_uid, bucket, &RowKeyCodec::join_tag_uids(&pairs));
        let key = Key::new(self.config.namespace.as_str(), ANNOTATION_KIND, row_key);

        run_with_retry(&self.config.retry, "annotation write", || {
            upsert_cell(self.store.as_ref(), key.clone(), &pairs, offset, annotation)
        })
        .await
    }

    /// Deleting annotations is not supported; this always succeeds and
    /// leaves stored annotations untouched.
    pub async fn delete_annotation(&self, annotation: &Annotation) -> Result<()> {
        debug!(
            "Ignoring delete for annotation at {} ({:?})",
            annotation.start_time, annotation.tsuid
        );
        Ok(())
    }

    fn series_of(&self, annotation: &Annotation) -> Result<(String, Vec<(String, String)>)> {
        match annotation.tsuid.as_deref() {
            Some(tsuid) if !annotation.is_global() => self.codec.decompose_tsuid(tsuid),
            _ => Ok((self.codec.global_metric_uid(), Vec::new())),
        }
    }
}
