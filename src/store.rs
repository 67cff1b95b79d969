//! Keyed state of a service, local or durable, optionally encrypted.
//!
//! Local keys live in the shared [`KvNamespace`] under
//! `<service>_<key>`. Durable keys live in a single-record actor reached
//! through a [`DurableStub`]. Both sides encrypt the same way when a
//! passphrase is given: a fresh IV per write, stored as the `iv` metadata
//! entry next to the ciphertext.
//!
//! Reads only decrypt when the stored metadata carries an `iv`. A value
//! written without a passphrase reads back as-is even if one is supplied, so
//! a key must be written consistently with or without a passphrase.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::{self, CipherProvider};
use crate::durable::{DURABLE_PATH, DurableRecord, DurableStub, StubRequest};
use crate::error::{Error, Result};
use crate::kv::{KvNamespace, ListOptions, ListResult, Metadata, PutOptions};
use crate::method::Method;

/// Shortest TTL a write honours. Shorter ones are written without expiry.
pub const MIN_TTL_SECONDS: u64 = 60;

const IV_FIELD: &str = "iv";

/// A value read back from the store.
///
/// `value` is `None` when the key is absent or the value could not be
/// decrypted with the supplied passphrase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredRecord {
    pub value: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone)]
pub struct KeyedStore {
    namespace: String,
    kv: Arc<dyn KvNamespace>,
    cipher: Arc<dyn CipherProvider>,
    headers: Vec<(String, String)>,
}

impl KeyedStore {
    pub fn new(namespace: &str, kv: Arc<dyn KvNamespace>, cipher: Arc<dyn CipherProvider>) -> Self {
        Self { namespace: namespace.to_owned(), kv, cipher, headers: Vec::new() }
    }

    /// Headers sent with every durable-actor request.
    pub fn with_headers(self, headers: Vec<(String, String)>) -> Self {
        Self { headers, ..self }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}_{key}", self.namespace)
    }

    // ── Local store ──────────────────────────────────────────────────────────

    pub async fn get(&self, key: &str, passphrase: Option<&str>) -> Result<Option<String>> {
        match passphrase {
            Some(_) => Ok(self.get_with_metadata(key, passphrase).await?.value),
            None => self.kv.get(&self.full_key(key)).await,
        }
    }

    pub async fn get_with_metadata(&self, key: &str, passphrase: Option<&str>) -> Result<StoredRecord> {
        let Some(entry) = self.kv.get_with_metadata(&self.full_key(key)).await? else {
            return Ok(StoredRecord::default());
        };
        let value = match (passphrase, iv_of(entry.metadata.as_ref())) {
            (Some(passphrase), Some(iv)) => self.decrypt_or_none(&entry.value, iv, key, passphrase),
            _ => Some(entry.value),
        };
        Ok(StoredRecord { value, metadata: entry.metadata })
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
        metadata: Option<Metadata>,
        passphrase: Option<&str>,
    ) -> Result<()> {
        let (value, metadata) = match passphrase {
            Some(passphrase) => self.seal(key, value, metadata, passphrase)?,
            None => (value.to_owned(), metadata),
        };
        let options = PutOptions { expiration_ttl: effective_ttl(key, ttl_seconds), metadata };
        self.kv.put(&self.full_key(key), value, options).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(&self.full_key(key)).await
    }

    /// Lists raw store keys. `prefix` is matched against full key names.
    pub async fn list(&self, prefix: Option<&str>, limit: Option<usize>, cursor: Option<&str>) -> Result<ListResult> {
        self.kv
            .list(ListOptions {
                prefix: prefix.map(str::to_owned),
                limit,
                cursor: cursor.map(str::to_owned),
            })
            .await
    }

    // ── Durable record ───────────────────────────────────────────────────────

    /// Writes the actor's record and returns what it stored.
    ///
    /// `ttl_seconds` below [`MIN_TTL_SECONDS`] is dropped; otherwise it is sent
    /// as the record's `expire` in milliseconds. A TTL too large to express in
    /// milliseconds fails with [`Error::Validation`].
    pub async fn set_durable(
        &self,
        stub: &dyn DurableStub,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
        meta: Option<Metadata>,
        passphrase: Option<&str>,
    ) -> Result<DurableRecord> {
        let expire = effective_ttl(key, ttl_seconds)
            .map(|secs| {
                secs.checked_mul(1000)
                    .ok_or_else(|| Error::Validation(format!("ttl of `{key}` is too large: {secs}s")))
            })
            .transpose()?;
        let (value, meta) = match passphrase {
            Some(passphrase) => self.seal(key, value, meta, passphrase)?,
            None => (value.to_owned(), meta),
        };
        let record = DurableRecord { key: key.to_owned(), value, expire, meta };

        let response = stub.fetch(self.durable_request(Method::Post, Some(serde_json::to_string(&record)?))).await?;
        if response.status != 200 {
            return Err(Error::Store(format!("durable write of `{key}` answered {}", response.status)));
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// The actor's record, decrypted when possible. Any failure reads as `None`.
    pub async fn get_durable_with_metadata(
        &self,
        stub: &dyn DurableStub,
        key: &str,
        passphrase: Option<&str>,
    ) -> Option<DurableRecord> {
        let response = match stub.fetch(self.durable_request(Method::Get, None)).await {
            Ok(response) if response.status == 200 => response,
            Ok(response) => {
                debug!(key, status = response.status, "durable record unavailable");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "durable read failed");
                return None;
            }
        };

        let mut record: DurableRecord = serde_json::from_str(&response.body)
            .inspect_err(|e| warn!(key, error = %e, "durable record is malformed"))
            .ok()?;
        if let (Some(passphrase), Some(iv)) = (passphrase, iv_of(record.meta.as_ref())) {
            record.value = self.decrypt_or_none(&record.value, iv, key, passphrase)?;
        }
        Some(record)
    }

    pub async fn get_durable(&self, stub: &dyn DurableStub, key: &str, passphrase: Option<&str>) -> Option<String> {
        self.get_durable_with_metadata(stub, key, passphrase).await.map(|record| record.value)
    }

    /// Clears the actor's record and its timer.
    pub async fn delete_durable(&self, stub: &dyn DurableStub) -> Result<Value> {
        let response = stub.fetch(self.durable_request(Method::Delete, None)).await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn seal(&self, key: &str, value: &str, metadata: Option<Metadata>, passphrase: &str) -> Result<(String, Option<Metadata>)> {
        let sealed = crypto::seal(self.cipher.as_ref(), value, key, passphrase)?;
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(IV_FIELD.to_owned(), Value::String(sealed.iv));
        Ok((sealed.ciphertext, Some(metadata)))
    }

    fn decrypt_or_none(&self, ciphertext: &str, iv: &str, key: &str, passphrase: &str) -> Option<String> {
        crypto::open(self.cipher.as_ref(), ciphertext, iv, key, passphrase)
            .inspect_err(|e| warn!(key, error = %e, "stored value could not be decrypted"))
            .ok()
    }

    fn durable_request(&self, method: Method, body: Option<String>) -> StubRequest {
        StubRequest { method, path: DURABLE_PATH.to_owned(), headers: self.headers.clone(), body }
    }
}

fn iv_of(metadata: Option<&Metadata>) -> Option<&str> {
    metadata?.get(IV_FIELD)?.as_str()
}

fn effective_ttl(key: &str, ttl_seconds: Option<u64>) -> Option<u64> {
    match ttl_seconds {
        Some(ttl) if ttl >= MIN_TTL_SECONDS => Some(ttl),
        Some(ttl) => {
            debug!(key, ttl, "ttl below {MIN_TTL_SECONDS}s, writing without expiry");
            None
        }
        None => None,
    }
}
