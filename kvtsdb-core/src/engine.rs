//! Tsdb - top-level facade over one store and one configuration

use crate::config::TsdbConfig;
use crate::query::{LookupEngine, RangeQueryEngine};
use crate::store::{JournalConfig, KvStore, MemoryStore};
use crate::uid::{ResolvedUids, UidRegistry};
use crate::writer::{AnnotationWriter, PointWriter, WriteResult};
use crate::{
    Annotation, Point, Result, Series, SeriesDescriptor, TagPredicate, Timestamp, UidKind,
    UidMeta,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Storage core facade.
///
/// Bundles the registry, writers and query engines over a shared store.
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Tsdb {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    registry: Arc<UidRegistry>,
    points: PointWriter,
    annotations: AnnotationWriter,
    queries: RangeQueryEngine,
    lookups: LookupEngine,
}

impl Tsdb {
    /// Create a facade over an existing store
    pub fn new(store: Arc<dyn KvStore>, config: TsdbConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(UidRegistry::new(store.clone(), config.clone()));

        Ok(Self {
            points: PointWriter::new(store.clone(), config.clone(), registry.clone()),
            annotations: AnnotationWriter::new(store.clone(), config.clone()),
            queries: RangeQueryEngine::new(store.clone(), config.clone(), registry.clone()),
            lookups: LookupEngine::new(store.clone(), config.clone(), registry.clone()),
            store,
            registry,
            config,
        })
    }

    /// Create a facade over a fresh in-memory store
    pub fn in_memory(config: TsdbConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Open a facade over a journal-backed store in `dir`, syncing every commit
    pub fn open(dir: impl AsRef<Path>, config: TsdbConfig) -> Result<Self> {
        Self::open_with(JournalConfig::new(dir.as_ref()), config)
    }

    /// Open a facade over a journal-backed store with explicit journal settings
    pub fn open_with(journal: JournalConfig, config: TsdbConfig) -> Result<Self> {
        let dir = journal.dir.clone();
        let sync_policy = journal.sync_policy;
        let store = MemoryStore::open(journal)?;
        info!(
            "Opened store in {:?} with {} keys (sync {})",
            dir,
            store.len(),
            sync_policy
        );
        Self::new(Arc::new(store), config)
    }

    /// Force committed data to durable storage
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Get the configuration
    pub fn config(&self) -> &TsdbConfig {
        &self.config
    }

    /// Uid for `name`, assigning one if absent
    pub async fn assign_or_resolve(&self, kind: UidKind, name: &str) -> Result<String> {
        self.registry.assign_if_absent(kind, name).await
    }

    pub async fn resolve(&self, kind: UidKind, name: &str) -> Result<String> {
        self.registry.resolve(kind, name).await
    }

    pub async fn resolve_uid(&self, kind: UidKind, uid: &str) -> Result<UidMeta> {
        self.registry.resolve_uid(kind, uid).await
    }

    pub async fn resolve_many(&self, kind: UidKind, uids: &[String]) -> Result<ResolvedUids> {
        self.registry.resolve_many(kind, uids).await
    }

    /// Names of `kind` starting with `prefix`
    pub async fn suggest(
        &self,
        kind: UidKind,
        prefix: &str,
        max: Option<usize>,
    ) -> Result<Vec<String>> {
        self.registry.suggest(kind, prefix, max).await
    }

    /// Store points; one result per point, in order
    pub async fn store_points(&self, points: &[Point]) -> Vec<WriteResult> {
        self.points.store_points(points).await
    }

    /// Store annotations; one result per annotation, in order
    pub async fn store_annotations(&self, annotations: &[Annotation]) -> Vec<WriteResult> {
        self.annotations.store_annotations(annotations).await
    }

    /// Accepted and ignored; annotations are never deleted
    pub async fn delete_annotation(&self, annotation: &Annotation) -> Result<()> {
        self.annotations.delete_annotation(annotation).await
    }

    /// Raw series of `metric` in `[start, end]`
    pub async fn query_range(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Series>> {
        self.queries.query_range(metric, start, end).await
    }

    pub async fn query_annotations(
        &self,
        tsuids: &[String],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Annotation>> {
        self.queries.query_annotations(tsuids, start, end).await
    }

    pub async fn query_global_annotations(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Annotation>> {
        self.queries.query_global_annotations(start, end).await
    }

    /// Series matching `predicates`, optionally scoped to one metric
    pub async fn lookup(
        &self,
        metric: Option<&str>,
        predicates: &[TagPredicate],
        limit: Option<usize>,
    ) -> Result<Vec<SeriesDescriptor>> {
        self.lookups.lookup(metric, predicates, limit).await
    }
}
