//! TTL'd key/value store: single-process writer, any-client reader,
//! no watches, no multi-key transactions, no ordering guarantees beyond
//! single-key linearizability. Backed by Redis in production; the
//! orchestrator's tests run against [`InMemoryKvStore`] instead.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kv store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode value for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn call_key(call_token: &str) -> String {
    format!("call:{call_token}")
}

pub fn channel_key(channel_id: &str) -> String {
    format!("channel:{channel_id}")
}

pub fn endpoint_key(endpoint_id: &str) -> String {
    format!("endpoint:{endpoint_id}")
}

pub fn originate_key(endpoint_id: &str) -> String {
    format!("originate:{endpoint_id}")
}

pub fn outgoing_key(outgoing_token: &str) -> String {
    format!("outgoing:{outgoing_token}")
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Atomic read-then-delete: the single-writer lease primitive. Two
    /// concurrent callers racing the same key never both observe `Some` —
    /// exactly one gets the value, the other gets `None`.
    async fn get_del_raw(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Convenience JSON helpers layered over the raw string operations so callers
/// never hand-roll `serde_json::to_string`/`from_str` at call sites.
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, encoded, ttl_secs).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key).await? {
            None => Ok(None),
            Some(raw) => {
                let value = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some(value))
            }
        }
    }

    async fn get_del_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_del_raw(key).await? {
            None => Ok(None),
            Some(raw) => {
                let value = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some(value))
            }
        }
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

/// Redis-backed implementation. Holds a [`redis::aio::ConnectionManager`],
/// which reconnects transparently on its own, so callers never see a
/// connection-dropped error from a transient Redis restart.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        tracing::info!("connected to redis kv store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn get_del_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }
}

/// Plain in-process store used by orchestrator tests. TTLs are accepted but
/// not enforced (tests assert on presence/absence directly rather than
/// waiting out real time).
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_raw(&self, key: &str, value: String, _ttl_secs: u64) -> Result<(), StoreError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn get_del_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().remove(key))
    }
}
