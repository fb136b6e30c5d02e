//! Transactional key-value store contract
//!
//! The core only needs point reads, batched reads, ordered range scans with
//! continuation cursors, and optimistic transactions whose commit reports a
//! write conflict as a typed outcome. [`MemoryStore`] is the bundled
//! implementation.

mod journal;
mod memory;

pub use journal::{Journal, JournalConfig, JournalEntry, SyncPolicy};
pub use memory::MemoryStore;

use crate::{Result, TsdbError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified store key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl Key {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Half-open range of names `[start, end)` within one namespace and kind.
/// `end: None` runs to the end of the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub namespace: String,
    pub kind: String,
    pub start: String,
    pub end: Option<String>,
}

impl KeyRange {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        start: impl Into<String>,
        end: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            start: start.into(),
            end,
        }
    }

    /// Whether a name falls inside the range
    pub fn contains(&self, name: &str) -> bool {
        name >= self.start.as_str() && self.end.as_deref().map_or(true, |end| name < end)
    }
}

/// A key/value pair returned by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub value: Bytes,
}

/// Opaque position to resume a scan after
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

/// One page of an ordered scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub records: Vec<Record>,
    /// Present when more records may follow
    pub cursor: Option<Cursor>,
}

/// Result of committing a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A concurrent commit touched a key this transaction read or wrote
    Conflict,
}

/// Abstract transactional store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &Key) -> Result<Option<Bytes>>;

    /// Read many keys, positionally
    async fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Bytes>>>;

    /// Scan a range in ascending key order, resuming after `after` if given.
    /// Returns at most `limit` records.
    async fn scan(
        &self,
        range: &KeyRange,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<ScanPage>;

    /// Begin an optimistic transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Make every committed transaction durable. Stores without a
    /// durability layer have nothing to do.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Optimistic transaction; nothing is visible to others until commit
#[async_trait]
pub trait Transaction: Send {
    /// Read a key, observing this transaction's own writes
    async fn get(&mut self, key: &Key) -> Result<Option<Bytes>>;

    /// Buffer a write
    fn put(&mut self, key: Key, value: Bytes);

    /// Apply buffered writes atomically, or report a conflict
    async fn commit(self: Box<Self>) -> Result<CommitOutcome>;
}

/// Drive a scan through every page, collecting all records.
///
/// `limit` bounds the total number of records; `None` scans to exhaustion.
#[tracing::instrument(level = "trace", skip(store))]
pub async fn scan_all(
    store: &dyn KvStore,
    range: &KeyRange,
    page_size: usize,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut cursor: Option<Cursor> = None;
    let mut pages = 0usize;

    loop {
        let want = match limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(records.len());
                if remaining == 0 {
                    break;
                }
                remaining.min(page_size)
            }
            None => page_size,
        };

        let page = store.scan(range, cursor.as_ref(), want).await?;
        pages += 1;
        records.extend(page.records);

        match page.cursor {
            // A cursor that does not advance would loop forever
            Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
            _ => break,
        }
    }

    tracing::trace!(pages, records = records.len(), "scan complete");
    Ok(records)
}

/// Serialize a stored document
pub(crate) fn encode_doc<T: Serialize>(doc: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(doc)?))
}

/// Deserialize a stored document, reporting failures as corruption
pub(crate) fn decode_doc<T: DeserializeOwned>(key: &Key, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value)
        .map_err(|e| TsdbError::Corruption(format!("Undecodable document at {}: {}", key, e)))
}
