//! Identifier registry
//!
//! Maps metric names, tag keys and tag values to fixed-width hex uids. Each
//! binding is stored twice in the kind's store kind, under `name:<name>` and
//! `id:<uid>`, and a per-kind sequence document hands out ids starting at 1.
//! Both records and the sequence bump are written in one transaction, so
//! concurrent assigners of the same name converge on one uid.

use crate::codec::RowKeyCodec;
use crate::config::TsdbConfig;
use crate::retry::{run_with_retry, Attempt};
use crate::store::{decode_doc, encode_doc, Cursor, Key, KeyRange, KvStore};
use crate::{Result, TsdbError, UidKind, UidMeta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Store kind holding the per-kind id counters
const SEQUENCE_KIND: &str = "uid_sequence";

const NAME_PREFIX: &str = "name:";
const ID_PREFIX: &str = "id:";

/// Exclusive upper bound of every `name:` record (`;` follows `:`)
const NAME_PREFIX_END: &str = "name;";

#[derive(Debug, Default, Serialize, Deserialize)]
struct UidSequence {
    next_id: u64,
}

/// Outcome of a batch id-to-name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUids {
    pub kind: UidKind,
    /// Bindings found, by uid
    pub found: BTreeMap<String, UidMeta>,
    /// Requested uids with no binding, in request order
    pub missing: Vec<String>,
}

impl ResolvedUids {
    /// Name bound to `uid`, if it resolved
    pub fn name_of(&self, uid: &str) -> Option<&str> {
        self.found.get(uid).map(|meta| meta.name.as_str())
    }

    /// Whether every requested uid resolved
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Treat any missing uid as a [`TsdbError::PartialLookupFailure`]
    pub fn into_complete(self) -> Result<BTreeMap<String, UidMeta>> {
        if self.missing.is_empty() {
            Ok(self.found)
        } else {
            Err(TsdbError::PartialLookupFailure {
                kind: self.kind,
                missing: self.missing,
            })
        }
    }
}

/// Name/uid registry over a [`KvStore`]
pub struct UidRegistry {
    store: Arc<dyn KvStore>,
    config: Arc<TsdbConfig>,
    codec: RowKeyCodec,
}

impl UidRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<TsdbConfig>) -> Self {
        let codec = RowKeyCodec::new(&config);
        Self {
            store,
            config,
            codec,
        }
    }

    fn name_key(&self, kind: UidKind, name: &str) -> Key {
        Key::new(
            self.config.namespace.as_str(),
            kind.store_kind(),
            format!("{}{}", NAME_PREFIX, name),
        )
    }

    fn id_key(&self, kind: UidKind, uid: &str) -> Key {
        Key::new(
            self.config.namespace.as_str(),
            kind.store_kind(),
            format!("{}{}", ID_PREFIX, uid),
        )
    }

    fn sequence_key(&self, kind: UidKind) -> Key {
        Key::new(self.config.namespace.as_str(), SEQUENCE_KIND, kind.as_str())
    }

    /// Look up the uid bound to `name`
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %kind))]
    pub async fn resolve(&self, kind: UidKind, name: &str) -> Result<String> {
        let key = self.name_key(kind, name);
        match self.store.get(&key).await? {
            Some(value) => Ok(decode_doc::<UidMeta>(&key, &value)?.uid),
            None => Err(TsdbError::not_found(kind, name)),
        }
    }

    /// Look up the binding for `uid`
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %kind))]
    pub async fn resolve_uid(&self, kind: UidKind, uid: &str) -> Result<UidMeta> {
        let key = self.id_key(kind, uid);
        match self.store.get(&key).await? {
            Some(value) => decode_doc(&key, &value),
            None => Err(TsdbError::not_found(kind, uid)),
        }
    }

    /// Resolve many uids with one batched read.
    ///
    /// Duplicates are collapsed. Unknown uids are reported in
    /// [`ResolvedUids::missing`] rather than failing the call.
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %kind, count = uids.len()))]
    pub async fn resolve_many(&self, kind: UidKind, uids: &[String]) -> Result<ResolvedUids> {
        let mut seen = BTreeSet::new();
        let unique: Vec<&String> = uids.iter().filter(|uid| seen.insert(*uid)).collect();

        let mut resolved = ResolvedUids {
            kind,
            found: BTreeMap::new(),
            missing: Vec::new(),
        };
        if unique.is_empty() {
            return Ok(resolved);
        }

        let keys: Vec<Key> = unique.iter().map(|uid| self.id_key(kind, uid)).collect();
        let values = self.store.get_many(&keys).await?;
        for ((uid, key), value) in unique.into_iter().zip(&keys).zip(values) {
            match value {
                Some(value) => {
                    let meta: UidMeta = decode_doc(key, &value)?;
                    resolved.found.insert(uid.clone(), meta);
                }
                None => resolved.missing.push(uid.clone()),
            }
        }
        Ok(resolved)
    }

    /// Return the uid bound to `name`, assigning the next id if there is none
    pub async fn assign_if_absent(&self, kind: UidKind, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(TsdbError::InvalidInput(format!("Empty {} name", kind)));
        }
        run_with_retry(&self.config.retry, "uid assignment", || {
            self.try_assign(kind, name)
        })
        .await
    }

    async fn try_assign(&self, kind: UidKind, name: &str) -> Result<Attempt<String>> {
        let mut txn = self.store.begin().await?;

        let name_key = self.name_key(kind, name);
        if let Some(value) = txn.get(&name_key).await? {
            let meta: UidMeta = decode_doc(&name_key, &value)?;
            return Ok(Attempt::Done(meta.uid));
        }

        let sequence_key = self.sequence_key(kind);
        let mut sequence = match txn.get(&sequence_key).await? {
            Some(value) => decode_doc::<UidSequence>(&sequence_key, &value)?,
            None => UidSequence { next_id: 1 },
        };
        let id = sequence.next_id;
        let uid = self.codec.format_uid(kind, id)?;
        sequence.next_id = id.checked_add(1).ok_or(TsdbError::SequenceOverflow {
            kind,
            width: self.config.uid_width(kind),
        })?;

        let meta = UidMeta {
            uid: uid.clone(),
            name: name.to_string(),
        };
        let encoded = encode_doc(&meta)?;
        txn.put(self.id_key(kind, &uid), encoded.clone());
        txn.put(name_key, encoded);
        txn.put(sequence_key, encode_doc(&sequence)?);

        let outcome = txn.commit().await?;
        let attempt = Attempt::from_commit(outcome, uid);
        if let Attempt::Done(uid) = &attempt {
            info!("Assigned {} uid {} to '{}'", kind, uid, name);
        }
        Ok(attempt)
    }

    /// Names of `kind` starting with `prefix`, in lexicographic order.
    ///
    /// `max` bounds the number of names returned; `None` returns them all.
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %kind))]
    pub async fn suggest(
        &self,
        kind: UidKind,
        prefix: &str,
        max: Option<usize>,
    ) -> Result<Vec<String>> {
        let range = KeyRange::new(
            self.config.namespace.as_str(),
            kind.store_kind(),
            format!("{}{}", NAME_PREFIX, prefix),
            Some(NAME_PREFIX_END.to_string()),
        );
        let limit = max.unwrap_or(usize::MAX);
        let mut names = Vec::new();
        let mut cursor: Option<Cursor> = None;

        while names.len() < limit {
            let want = (limit - names.len()).min(self.config.scan_page_size);
            let page = self.store.scan(&range, cursor.as_ref(), want).await?;

            for record in &page.records {
                let name = match record.key.name.strip_prefix(NAME_PREFIX) {
                    Some(name) if name.starts_with(prefix) => name,
                    _ => return Ok(names),
                };
                names.push(name.to_string());
                if names.len() >= limit {
                    break;
                }
            }

            match page.cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }

        debug!("Suggest {} '{}' matched {} names", kind, prefix, names.len());
        Ok(names)
    }
}
