use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use super::keys;
use super::{ClientId, MembershipStore, TopicName};
use crate::utils::error::StoreError;

type TxResult<T> = Result<T, ConflictableTransactionError<()>>;

const NO_EXPIRY: i64 = i64::MAX;

/// Bookkeeping for one set, stored in the `meta` tree under the set key.
///
/// Element rows carry the generation they were written in. An expired set is
/// replaced by a fresh generation inside the joining transaction, which turns
/// every older row into garbage without scanning for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SetMeta {
    generation: u64,
    len: u64,
    expires_at: Option<i64>,
}

impl SetMeta {
    fn fresh(generation: u64) -> Self {
        Self {
            generation,
            len: 0,
            expires_at: None,
        }
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let field = |at: usize| <[u8; 8]>::try_from(raw.get(at..at + 8)?).ok();
        let expires_at = i64::from_be_bytes(field(16)?);
        Some(Self {
            generation: u64::from_be_bytes(field(0)?),
            len: u64::from_be_bytes(field(8)?),
            expires_at: (expires_at != NO_EXPIRY).then_some(expires_at),
        })
    }

    fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.generation.to_be_bytes());
        out[8..16].copy_from_slice(&self.len.to_be_bytes());
        out[16..].copy_from_slice(&self.expires_at.unwrap_or(NO_EXPIRY).to_be_bytes());
        out
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn tag(&self) -> [u8; 8] {
        self.generation.to_be_bytes()
    }
}

/// Durable membership store backed by `sled`.
///
/// Every element of a set is a row `<set key>\0<item>` in the `sets` tree
/// whose value is the set's generation. The `meta` tree holds a `SetMeta`
/// per live set; a set without one is empty. `join` and `leave` update both
/// rows of an edge and both meta records in one multi-tree transaction, and
/// a set whose last row is removed loses its meta record, expiry included.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    sets: Tree,
    meta: Tree,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let sets = db.open_tree("sets")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, sets, meta })
    }

    /// Flushes dirty pages to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Live metadata of `set_key`, `None` when the set is empty or expired.
    fn live_meta(&self, set_key: &str, now: i64) -> Result<Option<SetMeta>, StoreError> {
        Ok(self
            .meta
            .get(set_key.as_bytes())?
            .and_then(|raw| SetMeta::decode(&raw))
            .filter(|meta| !meta.is_expired(now)))
    }

    fn read(&self, set_key: &str) -> Result<HashSet<String>, StoreError> {
        let Some(meta) = self.live_meta(set_key, Utc::now().timestamp_millis())? else {
            return Ok(HashSet::new());
        };
        let tag = meta.tag();
        let mut items = HashSet::new();
        for row in self.sets.scan_prefix(keys::row_prefix(set_key)) {
            let (row, generation) = row?;
            if generation[..] != tag[..] {
                continue;
            }
            if let Some((_, item)) = keys::split_row(&row) {
                items.insert(item.to_string());
            }
        }
        Ok(items)
    }

    fn dump(&self, prefix: &str) -> Result<HashMap<String, HashSet<String>>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut tags: HashMap<String, Option<[u8; 8]>> = HashMap::new();
        let mut out: HashMap<String, HashSet<String>> = HashMap::new();

        for row in self.sets.scan_prefix(prefix.as_bytes()) {
            let (row, generation) = row?;
            let Some((set_key, item)) = keys::split_row(&row) else {
                continue;
            };
            let tag = match tags.get(set_key) {
                Some(tag) => *tag,
                None => {
                    let tag = self.live_meta(set_key, now)?.map(|meta| meta.tag());
                    tags.insert(set_key.to_string(), tag);
                    tag
                }
            };
            if tag.is_none_or(|tag| generation[..] != tag[..]) {
                continue;
            }
            let name = set_key.strip_prefix(prefix).unwrap_or(set_key).to_string();
            out.entry(name).or_default().insert(item.to_string());
        }
        Ok(out)
    }

    /// Deletes rows left behind by an expired generation of `set_key`.
    ///
    /// Rows rewritten by a newer generation no longer match and are kept.
    fn sweep(&self, set_key: &str, stale: u64) -> Result<(), StoreError> {
        let stale = stale.to_be_bytes();
        let mut removed = 0usize;
        for row in self.sets.scan_prefix(keys::row_prefix(set_key)) {
            let (row, generation) = row?;
            if generation[..] != stale[..] {
                continue;
            }
            if self
                .sets
                .compare_and_swap(&row, Some(&stale[..]), None::<&[u8]>)?
                .is_ok()
            {
                removed += 1;
            }
        }
        tracing::debug!(key = set_key, removed, "swept expired membership rows");
        Ok(())
    }
}

/// Adds `item` to `set_key` and returns the generation it replaced, if the
/// set had expired.
fn insert_row(
    db: &Db,
    sets: &TransactionalTree,
    meta: &TransactionalTree,
    set_key: &str,
    item: &str,
    expires_at: Option<i64>,
    now: i64,
) -> TxResult<Option<u64>> {
    let current = meta
        .get(set_key.as_bytes())?
        .and_then(|raw| SetMeta::decode(&raw));
    let (mut set, stale) = match current {
        Some(set) if !set.is_expired(now) => (set, None),
        Some(set) => (SetMeta::fresh(db.generate_id()?), Some(set.generation)),
        None => (SetMeta::fresh(db.generate_id()?), None),
    };

    let row = keys::row_key(set_key, item);
    let tag = set.tag();
    let present = sets
        .get(row.as_slice())?
        .is_some_and(|generation| generation[..] == tag[..]);
    if !present {
        sets.insert(row, &tag[..])?;
        set.len += 1;
    }
    if expires_at.is_some() {
        set.expires_at = expires_at;
    }
    meta.insert(set_key.as_bytes(), &set.encode()[..])?;
    Ok(stale)
}

/// Removes `item` from `set_key`, dropping the meta record with the last row.
fn remove_row(
    sets: &TransactionalTree,
    meta: &TransactionalTree,
    set_key: &str,
    item: &str,
) -> TxResult<()> {
    let Some(generation) = sets.remove(keys::row_key(set_key, item))? else {
        return Ok(());
    };
    let Some(mut set) = meta
        .get(set_key.as_bytes())?
        .and_then(|raw| SetMeta::decode(&raw))
    else {
        return Ok(());
    };
    if generation[..] != set.tag()[..] {
        return Ok(());
    }
    set.len = set.len.saturating_sub(1);
    if set.len == 0 {
        meta.remove(set_key.as_bytes())?;
    } else {
        meta.insert(set_key.as_bytes(), &set.encode()[..])?;
    }
    Ok(())
}

fn storage_error(err: TransactionError<()>) -> StoreError {
    match err {
        TransactionError::Storage(e) => StoreError::from(e),
        TransactionError::Abort(()) => StoreError::Backend("transaction aborted".to_string()),
    }
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl MembershipStore for SledStore {
    async fn join(
        &self,
        topic: &str,
        client_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;

        let topic_key = keys::topic_key(topic);
        let member_key = keys::member_key(client_id);
        let now = Utc::now().timestamp_millis();
        let expires_at = ttl.map(|ttl| deadline(now, ttl));

        let result: TransactionResult<_, ()> =
            (&self.sets, &self.meta).transaction(|(sets, meta)| {
                let topic_stale =
                    insert_row(&self.db, sets, meta, &topic_key, client_id, expires_at, now)?;
                let member_stale =
                    insert_row(&self.db, sets, meta, &member_key, topic, expires_at, now)?;
                Ok((topic_stale, member_stale))
            });
        let (topic_stale, member_stale) = result.map_err(storage_error)?;

        if let Some(stale) = topic_stale {
            self.sweep(&topic_key, stale)?;
        }
        if let Some(stale) = member_stale {
            self.sweep(&member_key, stale)?;
        }
        Ok(())
    }

    async fn leave(&self, topic: &str, client_id: &str) -> Result<(), StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;

        let topic_key = keys::topic_key(topic);
        let member_key = keys::member_key(client_id);

        let result: TransactionResult<(), ()> =
            (&self.sets, &self.meta).transaction(|(sets, meta)| {
                remove_row(sets, meta, &topic_key, client_id)?;
                remove_row(sets, meta, &member_key, topic)?;
                Ok(())
            });
        result.map_err(storage_error)
    }

    async fn members(&self, topic: &str) -> Result<HashSet<ClientId>, StoreError> {
        keys::validate(topic)?;
        self.read(&keys::topic_key(topic))
    }

    async fn topics_of(&self, client_id: &str) -> Result<HashSet<TopicName>, StoreError> {
        keys::validate(client_id)?;
        self.read(&keys::member_key(client_id))
    }

    async fn is_member(&self, topic: &str, client_id: &str) -> Result<bool, StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;
        let topic_key = keys::topic_key(topic);
        let Some(meta) = self.live_meta(&topic_key, Utc::now().timestamp_millis())? else {
            return Ok(false);
        };
        Ok(self
            .sets
            .get(keys::row_key(&topic_key, client_id))?
            .is_some_and(|generation| generation[..] == meta.tag()[..]))
    }

    async fn topics_with_members(
        &self,
    ) -> Result<HashMap<TopicName, HashSet<ClientId>>, StoreError> {
        self.dump(keys::TOPIC_PREFIX)
    }

    async fn members_with_topics(
        &self,
    ) -> Result<HashMap<ClientId, HashSet<TopicName>>, StoreError> {
        self.dump(keys::MEMBER_PREFIX)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
