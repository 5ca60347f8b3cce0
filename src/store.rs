//! Cache Store Adapter: a narrow interface over the cache backend,
//! representing each `CacheEntry` as a HASH (one field per struct field)
//! rather than an opaque blob, matching the store's documented
//! representation.
//!
//! `CacheStore` is a trait rather than a concrete `Store` type so the
//! Request Handler and Refresher can be exercised in tests against an
//! in-memory double instead of a live Redis instance.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::cache::CacheEntry;
use crate::codec::CertStatus;
use crate::error::{OcspxyError, Result};

/// `Get`/`Put`/`Delete`/`ListKeys` over cache entries keyed by
/// `cache_key`. Implementations must treat an absent key as `Ok(None)`
/// from `get`, never as an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: &CacheEntry) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct Store {
    client: redis::Client,
}

impl Store {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| OcspxyError::StoreUnavailable(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| OcspxyError::StoreUnavailable(format!("connection failed: {e}")))
    }
}

#[async_trait]
impl CacheStore for Store {
    /// `Get(key) -> (entry | absent)`. Absent is represented as `Ok(None)`,
    /// never as an error.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| OcspxyError::StoreUnavailable(format!("HGETALL failed: {e}")))?;

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(decode_entry(key, &fields)?))
    }

    /// `Put(entry)`. Writes the full entry as a single atomic HSET of the
    /// struct's fields, keyed by `entry.cache_key`.
    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let mut conn = self.conn().await?;
        let fields = encode_entry(entry);
        let _: () = conn
            .hset_multiple(&entry.cache_key, &fields)
            .await
            .map_err(|e| OcspxyError::StoreUnavailable(format!("HSET failed: {e}")))?;
        Ok(())
    }

    /// `Delete(key)`.
    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| OcspxyError::StoreUnavailable(format!("DEL failed: {e}")))?;
        Ok(())
    }

    /// `ListKeys(prefix) -> [keys]`, implemented with `SCAN MATCH` rather
    /// than `KEYS` so a large keyspace does not block the Redis server.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(&pattern)
            .await
            .map_err(|e| OcspxyError::StoreUnavailable(format!("SCAN failed: {e}")))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

/// In-memory cache store for testing the Request Handler and Refresher
/// without a live Redis instance.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

fn encode_entry(entry: &CacheEntry) -> Vec<(String, String)> {
    vec![
        ("cache_key".into(), entry.cache_key.clone()),
        ("ocsp_responder".into(), entry.ocsp_responder.clone()),
        ("request".into(), hex::encode(&entry.request)),
        ("response".into(), hex::encode(&entry.response)),
        ("thisupd".into(), entry.thisupd.to_string()),
        ("nextupd".into(), entry.nextupd.to_string()),
        ("lastchecked".into(), entry.lastchecked.to_string()),
        ("status".into(), entry.status.as_str().to_string()),
        ("nonce".into(), entry.nonce.to_string()),
    ]
}

fn decode_entry(key: &str, fields: &HashMap<String, String>) -> Result<CacheEntry> {
    let get = |name: &str| -> Result<String> {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| OcspxyError::StoreCorrupt {
                key: key.to_string(),
                reason: format!("missing field {name}"),
            })
    };

    let parse_i64 = |name: &str, s: &str| -> Result<i64> {
        s.parse::<i64>().map_err(|e| OcspxyError::StoreCorrupt {
            key: key.to_string(),
            reason: format!("field {name} not an integer: {e}"),
        })
    };

    let request_hex = get("request")?;
    let response_hex = get("response")?;
    let status_str = get("status")?;
    let thisupd_str = get("thisupd")?;
    let nextupd_str = get("nextupd")?;
    let lastchecked_str = get("lastchecked")?;
    let nonce_str = get("nonce")?;

    let status = CertStatus::parse(&status_str).ok_or_else(|| OcspxyError::StoreCorrupt {
        key: key.to_string(),
        reason: format!("unrecognized status {status_str:?}"),
    })?;

    Ok(CacheEntry {
        cache_key: get("cache_key")?,
        ocsp_responder: get("ocsp_responder")?,
        request: hex::decode(&request_hex).map_err(|e| OcspxyError::StoreCorrupt {
            key: key.to_string(),
            reason: format!("request not valid hex: {e}"),
        })?,
        response: hex::decode(&response_hex).map_err(|e| OcspxyError::StoreCorrupt {
            key: key.to_string(),
            reason: format!("response not valid hex: {e}"),
        })?,
        thisupd: parse_i64("thisupd", &thisupd_str)?,
        nextupd: parse_i64("nextupd", &nextupd_str)?,
        lastchecked: parse_i64("lastchecked", &lastchecked_str)?,
        status,
        nonce: nonce_str.parse().map_err(|e| OcspxyError::StoreCorrupt {
            key: key.to_string(),
            reason: format!("nonce not an integer: {e}"),
        })?,
    })
}
