//! Commit journal for [`MemoryStore`](super::MemoryStore) durability
//!
//! Every committed transaction's write set is appended as one frame:
//!
//! - 4 bytes: payload length (little endian)
//! - N bytes: bincode-encoded [`JournalEntry`]
//! - 4 bytes: CRC32 of the payload
//!
//! On open the journal is replayed front to back. Only the final frame may be
//! short or fail its checksum; that is a torn write from a crash and is cut
//! off. Anything else that does not decode, including a length prefix larger
//! than [`MAX_FRAME_LEN`], is corruption and the file is left untouched.

use super::Key;
use crate::{Result, TsdbError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{error, info, warn};

const JOURNAL_FILE: &str = "journal.log";
const FRAME_HEADER: usize = 4;
const FRAME_OVERHEAD: usize = 8;

/// Largest payload a frame may carry
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// When appended frames are forced to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every commit
    #[default]
    Immediate,
    /// Sync after N commits
    EveryN(usize),
    /// Never sync explicitly; the OS flushes on its own schedule
    None,
}

impl FromStr for SyncPolicy {
    type Err = TsdbError;

    /// `always`, `never`, or `every:<n>`
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" | "immediate" => Ok(SyncPolicy::Immediate),
            "never" | "none" => Ok(SyncPolicy::None),
            other => other
                .strip_prefix("every:")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(SyncPolicy::EveryN)
                .ok_or_else(|| {
                    TsdbError::InvalidInput(format!(
                        "Invalid sync policy '{}', expected always, never or every:<n>",
                        other
                    ))
                }),
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPolicy::Immediate => f.write_str("always"),
            SyncPolicy::EveryN(n) => write!(f, "every:{}", n),
            SyncPolicy::None => f.write_str("never"),
        }
    }
}

/// Journal configuration
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the journal file
    pub dir: PathBuf,
    pub sync_policy: SyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_policy: SyncPolicy::default(),
        }
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }
}

/// Write set of one committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Store version assigned at commit
    pub version: u64,
    pub writes: Vec<(Key, Vec<u8>)>,
}

impl JournalEntry {
    /// Serialize the entry with length prefix and CRC checksum
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let payload =
            bincode::serialize(self).map_err(|e| TsdbError::InvalidFormat(e.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(TsdbError::InvalidInput(format!(
                "Commit of {} bytes exceeds the journal frame limit of {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));
        Ok(buf.freeze())
    }

    /// Deserialize one frame from the front of `data`, validating the checksum.
    /// Returns the entry and the number of bytes consumed.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FRAME_HEADER {
            return Err(TsdbError::InvalidFormat("Entry too short".into()));
        }
        let mut cursor = data;
        let len = cursor.get_u32_le() as usize;
        if len > MAX_FRAME_LEN {
            return Err(TsdbError::Corruption(format!(
                "Frame length {} exceeds limit {}",
                len, MAX_FRAME_LEN
            )));
        }
        if cursor.len() < len + 4 {
            return Err(TsdbError::InvalidFormat("Incomplete entry".into()));
        }

        let payload = &cursor[..len];
        let expected = read_u32_le(&cursor[len..len + 4]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(TsdbError::ChecksumMismatch { expected, actual });
        }

        let entry = bincode::deserialize(payload)
            .map_err(|e| TsdbError::Corruption(format!("Undecodable journal entry: {}", e)))?;
        Ok((entry, len + FRAME_OVERHEAD))
    }
}

/// Append-only commit journal
pub struct Journal {
    config: JournalConfig,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    file: File,
    /// Length of the file up to the last complete frame
    len: u64,
    writes_since_sync: usize,
    /// Set when a failed append could not be rolled back
    failed: bool,
}

impl Journal {
    /// Open the journal, replaying existing entries.
    ///
    /// Returns the journal positioned for appends and every intact entry
    /// in commit order.
    pub fn open(config: JournalConfig) -> Result<(Self, Vec<JournalEntry>)> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(JOURNAL_FILE);

        let mut data = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut data)?;
        }
        let (entries, valid_len) = Self::replay(&data)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if valid_len < data.len() {
            warn!(
                "Discarding {} bytes of torn journal tail in {:?}",
                data.len() - valid_len,
                path
            );
            file.set_len(valid_len as u64)?;
        }
        if !entries.is_empty() {
            info!("Recovered {} journal entries from {:?}", entries.len(), path);
        }

        let journal = Self {
            config,
            inner: Mutex::new(JournalInner {
                file,
                len: valid_len as u64,
                writes_since_sync: 0,
                failed: false,
            }),
        };
        Ok((journal, entries))
    }

    /// Decode every frame, returning the entries and the length of the valid
    /// prefix. Only a damaged final frame is tolerated.
    fn replay(data: &[u8]) -> Result<(Vec<JournalEntry>, usize)> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let rest = &data[offset..];
            match JournalEntry::deserialize_with_checksum(rest) {
                Ok((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                // Short header or short frame: both can only be the tail
                Err(TsdbError::InvalidFormat(_)) => break,
                Err(TsdbError::ChecksumMismatch { expected, actual }) => {
                    let len = read_u32_le(rest) as usize;
                    if offset + len + FRAME_OVERHEAD == data.len() {
                        break;
                    }
                    return Err(TsdbError::Corruption(format!(
                        "Journal checksum mismatch at offset {}: expected {}, got {}",
                        offset, expected, actual
                    )));
                }
                Err(TsdbError::Corruption(msg)) => {
                    return Err(TsdbError::Corruption(format!(
                        "Journal frame at offset {}: {}",
                        offset, msg
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        Ok((entries, offset))
    }

    /// Append an entry, syncing according to policy.
    ///
    /// A failed write is rolled back to the last complete frame. If that is
    /// impossible the journal refuses further appends with
    /// [`TsdbError::JournalFailed`].
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = entry.serialize_with_checksum()?;
        let mut inner = self.inner.lock();
        if inner.failed {
            return Err(TsdbError::JournalFailed(
                "journal is unusable after an earlier write failure".into(),
            ));
        }

        if let Err(e) = inner.file.write_all(&frame) {
            let len = inner.len;
            return match inner.file.set_len(len) {
                Ok(()) => {
                    warn!("Journal append failed, rolled back to {} bytes: {}", len, e);
                    Err(TsdbError::Io(e))
                }
                Err(rollback) => {
                    error!(
                        "Journal append failed ({}) and rollback failed ({}); refusing further writes",
                        e, rollback
                    );
                    inner.failed = true;
                    Err(TsdbError::JournalFailed(e.to_string()))
                }
            };
        }
        inner.len += frame.len() as u64;
        inner.writes_since_sync += 1;

        let sync = match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::None => false,
        };
        if sync {
            inner.file.sync_data()?;
            inner.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Sync policy in effect
    pub fn sync_policy(&self) -> SyncPolicy {
        self.config.sync_policy
    }

    /// Appends since the last sync
    pub fn pending_syncs(&self) -> usize {
        self.inner.lock().writes_since_sync
    }
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}
