//! Contract of the multi-key store a service keeps its state in.
//!
//! The store engine itself lives outside this crate. [`KvNamespace`] is the
//! surface svcbase needs from it: per-key last-write-wins reads and writes
//! with optional metadata and TTL, plus prefix listing with a cursor. There is
//! no cross-key atomicity; callers must not assume it.
//!
//! [`MemoryKv`] is an in-process implementation with the same semantics, used
//! by tests and local runs.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Free-form metadata stored next to a value.
pub type Metadata = Map<String, Value>;

const DEFAULT_LIST_LIMIT: usize = 1000;

#[derive(Clone, Debug, PartialEq)]
pub struct KvEntry {
    pub value: String,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Seconds until the store drops the value.
    pub expiration_ttl: Option<u64>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListKey {
    pub name: String,
    /// Unix seconds at which the key expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListResult {
    pub keys: Vec<ListKey>,
    pub list_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[async_trait]
pub trait KvNamespace: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_with_metadata(key).await?.map(|entry| entry.value))
    }

    async fn get_with_metadata(&self, key: &str) -> Result<Option<KvEntry>>;

    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, options: ListOptions) -> Result<ListResult>;
}

struct Slot {
    value: String,
    metadata: Option<Metadata>,
    ttl: Option<u64>,
    expires_at: Option<Instant>,
    expiration_unix: Option<i64>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory [`KvNamespace`].
#[derive(Default)]
pub struct MemoryKv {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL in seconds the key was written with, if any.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.slots.lock().ok()?.get(key).and_then(|slot| slot.ttl)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Slot>>> {
        self.slots.lock().map_err(|_| Error::Store("memory kv lock poisoned".into()))
    }
}

#[async_trait]
impl KvNamespace for MemoryKv {
    async fn get_with_metadata(&self, key: &str) -> Result<Option<KvEntry>> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(KvEntry {
                value: slot.value.clone(),
                metadata: slot.metadata.clone(),
            })),
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<()> {
        // A TTL past what the clocks can represent never expires.
        let expires_at = options
            .expiration_ttl
            .and_then(|ttl| Instant::now().checked_add(Duration::from_secs(ttl)));
        let expiration_unix = options
            .expiration_ttl
            .and_then(|ttl| i64::try_from(ttl).ok())
            .and_then(|ttl| chrono::Utc::now().timestamp().checked_add(ttl));
        self.lock()?.insert(
            key.to_owned(),
            Slot { value, metadata: options.metadata, ttl: options.expiration_ttl, expires_at, expiration_unix },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult> {
        let now = Instant::now();
        let limit = options.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let prefix = options.prefix.unwrap_or_default();
        let slots = self.lock()?;

        let lower = match &options.cursor {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Included(prefix.clone()),
        };
        let mut matching = slots
            .range((lower, Bound::Unbounded))
            .filter(|(name, _)| name.starts_with(&prefix))
            .filter(|(_, slot)| slot.is_live(now));

        let keys: Vec<ListKey> = matching
            .by_ref()
            .take(limit)
            .map(|(name, slot)| ListKey {
                name: name.clone(),
                expiration: slot.expiration_unix,
                metadata: slot.metadata.clone(),
            })
            .collect();
        let list_complete = matching.next().is_none();
        let cursor = if list_complete { None } else { keys.last().map(|k| k.name.clone()) };

        Ok(ListResult { keys, list_complete, cursor })
    }
}
