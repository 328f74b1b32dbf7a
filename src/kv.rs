//! Key-value client seam.
//!
//! The coordinator persists everything through [`KvClient`], a thin
//! Redis-shaped interface (strings, hashes, sets). [`RedisKv`] is the
//! production implementation; [`MemoryKv`] keeps the same semantics in
//! process memory for tests and embedded single-process use.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::Error;

/// Redis-shaped storage operations used by the coordinator.
///
/// Implementations must make `hincr_by` atomic: heartbeat counters are
/// incremented concurrently by probe workers.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), Error>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a string value.
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Delete a key of any kind. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), Error>;

    /// List keys matching a glob pattern (only trailing-`*` patterns are
    /// used by this crate).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error>;

    /// Set fields on a hash, creating it if absent.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), Error>;

    /// Read all fields of a hash. Missing keys yield an empty map.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    /// Atomically add `delta` to an integer hash field, returning the
    /// updated value. Missing fields start at zero.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, Error>;

    /// Add a member to a set, creating it if absent.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<(), Error>;

    /// Read all members of a set. Missing keys yield an empty list.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;
}

/// [`KvClient`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisKv {
    conn: MultiplexedConnection,
}

impl RedisKv {
    /// Wrap an existing multiplexed connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the connection cannot be
    /// established.
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

/// One entry in the in-memory store.
#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

/// In-memory [`KvClient`] with Redis semantics. Zero network I/O.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("kv lock poisoned")
    }
}

fn wrong_type() -> Error {
    Error::StoreUnavailable(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "WRONGTYPE operation against a key holding the wrong kind of value",
    )))
}

fn not_an_integer() -> Error {
    Error::StoreUnavailable(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "hash value is not an integer",
    )))
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self.lock().get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.lock()
            .insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let entries = self.lock();
        let matched = match pattern.strip_suffix('*') {
            Some(prefix) => entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => entries.keys().filter(|k| *k == pattern).cloned().collect(),
        };
        Ok(matched)
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), Error> {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        let Entry::Hash(hash) = entry else {
            return Err(wrong_type());
        };
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        match self.lock().get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, Error> {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        let Entry::Hash(hash) = entry else {
            return Err(wrong_type());
        };
        let current = match hash.get(field) {
            Some(value) => value.parse::<i64>().map_err(|_| not_an_integer())?,
            None => 0,
        };
        let updated = current + delta;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()));
        let Entry::Set(set) = entry else {
            return Err(wrong_type());
        };
        set.insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), Error> {
        match self.lock().get_mut(key) {
            None => Ok(()),
            Some(Entry::Set(set)) => {
                set.remove(member);
                Ok(())
            }
            Some(_) => Err(wrong_type()),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        match self.lock().get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_string_roundtrip() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("k").await.unwrap(), None);
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let kv = MemoryKv::new();
        kv.hset("h", &[("a", "1".into()), ("b", "2".into())])
            .await
            .unwrap();
        kv.hset("h", &[("b", "3".into())]).await.unwrap();

        let hash = kv.hget_all("h").await.unwrap();
        assert_eq!(hash.get("a"), Some(&"1".to_string()));
        assert_eq!(hash.get("b"), Some(&"3".to_string()));
        assert_eq!(kv.hget_all("missing").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_hincr_by_starts_at_zero_and_returns_updated() {
        let kv = MemoryKv::new();
        assert_eq!(kv.hincr_by("h", "n", 1).await.unwrap(), 1);
        assert_eq!(kv.hincr_by("h", "n", 1).await.unwrap(), 2);
        assert_eq!(kv.hincr_by("h", "n", -2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let kv = Arc::new(MemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    kv.hincr_by("h", "n", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(kv.hincr_by("h", "n", 0).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_keys_prefix_pattern() {
        let kv = MemoryKv::new();
        kv.set("p:nodes:a", "1").await.unwrap();
        kv.set("p:nodes:b", "1").await.unwrap();
        kv.set("p:keymap:x", "1").await.unwrap();

        let mut keys = kv.keys("p:nodes:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p:nodes:a", "p:nodes:b"]);
        assert_eq!(kv.keys("p:keymap:x").await.unwrap(), vec!["p:keymap:x"]);
    }

    #[tokio::test]
    async fn test_set_membership() {
        let kv = MemoryKv::new();
        kv.sadd("s", "a").await.unwrap();
        kv.sadd("s", "b").await.unwrap();
        kv.sadd("s", "a").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["a", "b"]);

        kv.srem("s", "a").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["b"]);
        assert!(kv.smembers("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let kv = MemoryKv::new();
        kv.set("k", "v").await.unwrap();
        assert!(kv.hget_all("k").await.is_err());
        assert!(kv.sadd("k", "m").await.is_err());
        assert!(kv.hincr_by("k", "f", 1).await.is_err());
    }
}
