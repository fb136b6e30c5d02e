//! In-memory transactional store with optional journal durability

use super::{
    CommitOutcome, Cursor, Journal, JournalConfig, JournalEntry, Key, KeyRange, KvStore, Record,
    ScanPage, Transaction,
};
use crate::{Result, TsdbError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Largest page a single scan call returns
pub const DEFAULT_MAX_PAGE_SIZE: usize = 500;

/// Ordered in-memory store with optimistic transactions.
///
/// Every commit bumps a store-wide version and stamps it on the keys it
/// writes. A transaction remembers the version current at `begin` and every
/// key it read or wrote; commit fails with [`CommitOutcome::Conflict`] when
/// any of those keys carries a newer version (first committer wins).
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    max_page_size: usize,
}

struct Shared {
    state: RwLock<State>,
    journal: Option<Journal>,
    available: AtomicBool,
    injected_conflicts: AtomicU32,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<Key, Versioned>,
    version: u64,
}

struct Versioned {
    value: Bytes,
    version: u64,
}

impl State {
    fn apply(&mut self, version: u64, writes: impl IntoIterator<Item = (Key, Bytes)>) {
        for (key, value) in writes {
            self.entries.insert(key, Versioned { value, version });
        }
        self.version = self.version.max(version);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, non-durable store
    pub fn new() -> Self {
        Self::with_state(State::default(), None)
    }

    /// Open a journal-backed store, replaying previously committed writes
    pub fn open(config: JournalConfig) -> Result<Self> {
        let (journal, entries) = Journal::open(config)?;
        let mut state = State::default();
        for entry in entries {
            let writes = entry
                .writes
                .into_iter()
                .map(|(key, value)| (key, Bytes::from(value)));
            state.apply(entry.version, writes);
        }
        Ok(Self::with_state(state, Some(journal)))
    }

    fn with_state(state: State, journal: Option<Journal>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                journal,
                available: AtomicBool::new(true),
                injected_conflicts: AtomicU32::new(0),
            }),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Cap the number of records any one scan call returns
    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggle availability; while unavailable every call fails with
    /// [`TsdbError::StoreUnavailable`]. Used to exercise failure paths.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` commits report a conflict. Used to exercise retries.
    pub fn inject_conflicts(&self, n: u32) {
        self.shared.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Force the journal to disk, if any
    pub fn sync(&self) -> Result<()> {
        match &self.shared.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn check_available(&self) -> Result<()> {
        self.shared.check_available()
    }
}

impl Shared {
    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TsdbError::StoreUnavailable("memory store marked unavailable".into()))
        }
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &Key) -> Result<Option<Bytes>> {
        self.check_available()?;
        let state = self.shared.state.read();
        Ok(state.entries.get(key).map(|v| v.value.clone()))
    }

    async fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Bytes>>> {
        self.check_available()?;
        let state = self.shared.state.read();
        Ok(keys
            .iter()
            .map(|key| state.entries.get(key).map(|v| v.value.clone()))
            .collect())
    }

    async fn scan(
        &self,
        range: &KeyRange,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<ScanPage> {
        self.check_available()?;
        let limit = limit.min(self.max_page_size);
        if limit == 0 {
            return Ok(ScanPage::default());
        }

        let lower = match after {
            Some(Cursor(name)) if name.as_str() >= range.start.as_str() => Bound::Excluded(
                Key::new(range.namespace.as_str(), range.kind.as_str(), name.as_str()),
            ),
            _ => Bound::Included(Key::new(
                range.namespace.as_str(),
                range.kind.as_str(),
                range.start.as_str(),
            )),
        };

        let state = self.shared.state.read();
        let records: Vec<Record> = state
            .entries
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| {
                key.namespace == range.namespace
                    && key.kind == range.kind
                    && range.contains(&key.name)
            })
            .take(limit)
            .map(|(key, v)| Record {
                key: key.clone(),
                value: v.value.clone(),
            })
            .collect();

        let cursor = if records.len() == limit {
            records.last().map(|r| Cursor(r.key.name.clone()))
        } else {
            None
        };
        Ok(ScanPage { records, cursor })
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.check_available()?;
        let start_version = self.shared.state.read().version;
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            start_version,
            reads: BTreeSet::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        self.sync()
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    start_version: u64,
    reads: BTreeSet<Key>,
    writes: BTreeMap<Key, Bytes>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &Key) -> Result<Option<Bytes>> {
        self.shared.check_available()?;
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        self.reads.insert(key.clone());
        let state = self.shared.state.read();
        Ok(state.entries.get(key).map(|v| v.value.clone()))
    }

    fn put(&mut self, key: Key, value: Bytes) {
        self.writes.insert(key, value);
    }

    async fn commit(self: Box<Self>) -> Result<CommitOutcome> {
        self.shared.check_available()?;
        if self.shared.take_injected_conflict() {
            debug!("Reporting injected commit conflict");
            return Ok(CommitOutcome::Conflict);
        }

        let MemoryTransaction {
            shared,
            start_version,
            reads,
            writes,
        } = *self;

        let mut state = shared.state.write();
        let conflicted = reads.iter().chain(writes.keys()).any(|key| {
            state
                .entries
                .get(key)
                .map_or(false, |v| v.version > start_version)
        });
        if conflicted {
            return Ok(CommitOutcome::Conflict);
        }
        if writes.is_empty() {
            return Ok(CommitOutcome::Committed);
        }

        let version = state.version + 1;
        if let Some(journal) = &shared.journal {
            let entry = JournalEntry {
                version,
                writes: writes
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_vec()))
                    .collect(),
            };
            journal.append(&entry)?;
        }
        state.apply(version, writes);
        Ok(CommitOutcome::Committed)
    }
}
