//! Namespaced persistence for members, counters, and key mappings.
//!
//! Every key lives under `{prefix}:{namespace}:`; the kinds are
//! `nodes:{id}` (hash of member fields), `nodekeys:{id}` (set of keys owned
//! by the node), and `keymap:{key}` (owning node id). Values are stored as
//! plain strings so other clients sharing the namespace can read them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::Error;
use crate::kv::KvClient;
use crate::member::{Member, MemberState};

// Persisted hash field names. `hearbeat_count` is misspelled on the wire;
// existing namespaces were written with it, so it stays.
const FIELD_ADDRESS: &str = "address";
const FIELD_PATH: &str = "path";
const FIELD_JOINED_AT: &str = "joined_at";
const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";
const FIELD_HEARTBEAT_COUNT: &str = "hearbeat_count";
const FIELD_HEARTBEAT_FAILURES: &str = "heartbeat_failure_count";
const FIELD_STATE: &str = "state";

/// Storage adapter over an injected [`KvClient`].
#[derive(Clone)]
pub struct Store {
    prefix: String,
    namespace: String,
    kv: Arc<dyn KvClient>,
}

impl Store {
    pub fn new(prefix: impl Into<String>, namespace: impl Into<String>, kv: Arc<dyn KvClient>) -> Self {
        Self {
            prefix: prefix.into(),
            namespace: namespace.into(),
            kv,
        }
    }

    fn make_key(&self, parts: &[&str]) -> String {
        format!("{}:{}:{}", self.prefix, self.namespace, parts.join(":"))
    }

    /// Check that the underlying store is reachable.
    pub async fn ping(&self) -> Result<(), Error> {
        self.kv.ping().await
    }

    /// Write a new member record with `state = alive` and zeroed counters.
    ///
    /// Overwrites an existing record for the same id; callers that need
    /// duplicate detection must check with [`get_node`](Self::get_node)
    /// first.
    pub async fn add_node(
        &self,
        node_id: &str,
        address: &str,
        path: &str,
        port: u16,
    ) -> Result<(), Error> {
        let key = self.make_key(&["nodes", node_id]);
        let now = unix_now().to_string();
        let node_address = format!("{address}:{port}");

        self.kv
            .hset(
                &key,
                &[
                    (FIELD_ADDRESS, node_address),
                    (FIELD_PATH, path.to_string()),
                    (FIELD_JOINED_AT, now.clone()),
                    (FIELD_LAST_HEARTBEAT, now),
                    (FIELD_HEARTBEAT_COUNT, "0".to_string()),
                    (FIELD_HEARTBEAT_FAILURES, "0".to_string()),
                    (FIELD_STATE, MemberState::Alive.as_str().to_string()),
                ],
            )
            .await
    }

    /// Read a member record. Returns `None` if the node is unknown.
    ///
    /// # Errors
    ///
    /// `FieldMissing` if the record exists but a required field is absent
    /// or unparseable.
    pub async fn get_node(&self, node_id: &str) -> Result<Option<Member>, Error> {
        let key = self.make_key(&["nodes", node_id]);
        let fields = self.kv.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(member_from_fields(node_id, &fields)?))
    }

    /// Enumerate all member records in this namespace.
    ///
    /// Records deleted between the key scan and the field read are skipped;
    /// membership may churn while the scan runs.
    pub async fn get_nodes(&self) -> Result<Vec<Member>, Error> {
        let pattern = self.make_key(&["nodes", "*"]);
        let node_key_prefix = self.make_key(&["nodes", ""]);

        let keys = self.kv.keys(&pattern).await?;
        let mut members = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(node_id) = key.strip_prefix(&node_key_prefix) else {
                continue;
            };
            if let Some(member) = self.get_node(node_id).await? {
                members.push(member);
            }
        }
        Ok(members)
    }

    /// Remove a member record along with its key mappings.
    ///
    /// Order: forward `keymap` entries first, then the `nodekeys` set, then
    /// the member record. A crash mid-removal can leave orphaned keymap
    /// entries; they are overwritten by the next distribution or lookup.
    pub async fn remove_node(&self, node_id: &str) -> Result<(), Error> {
        let owned = self.get_node_keys(node_id).await?;
        for key in &owned {
            self.kv.del(&self.make_key(&["keymap", key])).await?;
        }
        self.kv.del(&self.make_key(&["nodekeys", node_id])).await?;
        self.kv.del(&self.make_key(&["nodes", node_id])).await?;

        debug!(%node_id, keys = owned.len(), "removed node record and key mappings");
        Ok(())
    }

    /// Set the member's last heartbeat to the current time.
    pub async fn update_node_heartbeat(&self, node_id: &str) -> Result<(), Error> {
        let key = self.make_key(&["nodes", node_id]);
        self.kv
            .hset(&key, &[(FIELD_LAST_HEARTBEAT, unix_now().to_string())])
            .await
    }

    /// Set the member's failure-detector state.
    pub async fn update_node_state(&self, node_id: &str, state: MemberState) -> Result<(), Error> {
        let key = self.make_key(&["nodes", node_id]);
        self.kv
            .hset(&key, &[(FIELD_STATE, state.as_str().to_string())])
            .await
    }

    /// Atomically increment the probe counter, returning the updated value.
    pub async fn increment_heartbeats(&self, node_id: &str) -> Result<u64, Error> {
        let key = self.make_key(&["nodes", node_id]);
        let updated = self.kv.hincr_by(&key, FIELD_HEARTBEAT_COUNT, 1).await?;
        Ok(updated.max(0) as u64)
    }

    /// Atomically increment the consecutive-failure counter, returning the
    /// updated value. The failure threshold is checked against this result.
    pub async fn increment_heartbeat_failures(&self, node_id: &str) -> Result<u64, Error> {
        let key = self.make_key(&["nodes", node_id]);
        let updated = self.kv.hincr_by(&key, FIELD_HEARTBEAT_FAILURES, 1).await?;
        Ok(updated.max(0) as u64)
    }

    /// Reset the consecutive-failure counter to zero.
    pub async fn reset_heartbeat_failures(&self, node_id: &str) -> Result<(), Error> {
        let key = self.make_key(&["nodes", node_id]);
        self.kv
            .hset(&key, &[(FIELD_HEARTBEAT_FAILURES, "0".to_string())])
            .await
    }

    /// Write the forward `key -> node` mapping.
    pub async fn set_key_node(&self, key: &str, node_id: &str) -> Result<(), Error> {
        self.kv.set(&self.make_key(&["keymap", key]), node_id).await
    }

    /// Read the forward `key -> node` mapping.
    pub async fn get_key_node(&self, key: &str) -> Result<Option<String>, Error> {
        self.kv.get(&self.make_key(&["keymap", key])).await
    }

    /// Add a key to a node's reverse mapping.
    pub async fn add_node_key(&self, node_id: &str, key: &str) -> Result<(), Error> {
        self.kv.sadd(&self.make_key(&["nodekeys", node_id]), key).await
    }

    /// Read the keys a node currently owns.
    pub async fn get_node_keys(&self, node_id: &str) -> Result<Vec<String>, Error> {
        self.kv.smembers(&self.make_key(&["nodekeys", node_id])).await
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs() as i64
}

fn member_from_fields(node_id: &str, fields: &HashMap<String, String>) -> Result<Member, Error> {
    Ok(Member {
        id: node_id.to_string(),
        address: required(fields, FIELD_ADDRESS)?.to_string(),
        path: required(fields, FIELD_PATH)?.to_string(),
        joined_at_unix: required_int(fields, FIELD_JOINED_AT)?,
        last_heartbeat_unix: required_int(fields, FIELD_LAST_HEARTBEAT)?,
        heartbeat_count: required_int::<u64>(fields, FIELD_HEARTBEAT_COUNT)?,
        heartbeat_failures: required_int::<u64>(fields, FIELD_HEARTBEAT_FAILURES)?,
        state: required(fields, FIELD_STATE)?.parse()?,
    })
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, Error> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(Error::FieldMissing(name))
}

fn required_int<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<T, Error> {
    required(fields, name)?
        .parse()
        .map_err(|_| Error::FieldMissing(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn test_store() -> (Store, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let store = Store::new("pantheon", "test-cluster", kv.clone());
        (store, kv)
    }

    #[tokio::test]
    async fn test_add_and_get_node() {
        let (store, _) = test_store();
        store.add_node("A", "http://10.0.0.1", "health", 8080).await.unwrap();

        let member = store.get_node("A").await.unwrap().unwrap();
        assert_eq!(member.id, "A");
        assert_eq!(member.address, "http://10.0.0.1:8080");
        assert_eq!(member.path, "health");
        assert_eq!(member.state, MemberState::Alive);
        assert_eq!(member.heartbeat_count, 0);
        assert_eq!(member.heartbeat_failures, 0);
        assert!(member.joined_at_unix > 0);
        assert_eq!(member.joined_at_unix, member.last_heartbeat_unix);
    }

    #[tokio::test]
    async fn test_get_missing_node_is_none() {
        let (store, _) = test_store();
        assert!(store.get_node("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_reports_missing_field() {
        let (store, kv) = test_store();
        kv.hset(
            "pantheon:test-cluster:nodes:A",
            &[("address", "http://a:80".into()), ("path", "h".into())],
        )
        .await
        .unwrap();

        assert!(matches!(
            store.get_node("A").await,
            Err(Error::FieldMissing("joined_at"))
        ));
    }

    #[tokio::test]
    async fn test_get_nodes_enumerates_namespace() {
        let (store, kv) = test_store();
        store.add_node("A", "http://a", "h", 80).await.unwrap();
        store.add_node("B", "http://b", "h", 80).await.unwrap();
        // A record from another namespace must not leak in.
        kv.hset("pantheon:other:nodes:C", &[("address", "x".into())])
            .await
            .unwrap();

        let mut ids: Vec<String> = store
            .get_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_remove_node_cascades_key_mappings() {
        let (store, _) = test_store();
        store.add_node("A", "http://a", "h", 80).await.unwrap();
        store.set_key_node("x", "A").await.unwrap();
        store.set_key_node("y", "A").await.unwrap();
        store.add_node_key("A", "x").await.unwrap();
        store.add_node_key("A", "y").await.unwrap();

        store.remove_node("A").await.unwrap();

        assert!(store.get_node("A").await.unwrap().is_none());
        assert!(store.get_node_keys("A").await.unwrap().is_empty());
        assert!(store.get_key_node("x").await.unwrap().is_none());
        assert!(store.get_key_node("y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters_return_updated_values() {
        let (store, _) = test_store();
        store.add_node("A", "http://a", "h", 80).await.unwrap();

        assert_eq!(store.increment_heartbeats("A").await.unwrap(), 1);
        assert_eq!(store.increment_heartbeats("A").await.unwrap(), 2);
        assert_eq!(store.increment_heartbeat_failures("A").await.unwrap(), 1);
        assert_eq!(store.increment_heartbeat_failures("A").await.unwrap(), 2);

        store.reset_heartbeat_failures("A").await.unwrap();
        let member = store.get_node("A").await.unwrap().unwrap();
        assert_eq!(member.heartbeat_failures, 0);
        assert_eq!(member.heartbeat_count, 2);
    }

    #[tokio::test]
    async fn test_update_state_and_heartbeat() {
        let (store, _) = test_store();
        store.add_node("A", "http://a", "h", 80).await.unwrap();

        store.update_node_state("A", MemberState::Suspect).await.unwrap();
        let member = store.get_node("A").await.unwrap().unwrap();
        assert_eq!(member.state, MemberState::Suspect);

        store.update_node_heartbeat("A").await.unwrap();
        let member = store.get_node("A").await.unwrap().unwrap();
        assert!(member.last_heartbeat_unix >= member.joined_at_unix);
    }

    #[tokio::test]
    async fn test_key_mappings_roundtrip() {
        let (store, _) = test_store();
        store.set_key_node("x", "A").await.unwrap();
        store.add_node_key("A", "x").await.unwrap();

        assert_eq!(store.get_key_node("x").await.unwrap(), Some("A".to_string()));
        assert_eq!(store.get_node_keys("A").await.unwrap(), vec!["x"]);
        assert!(store.get_key_node("unmapped").await.unwrap().is_none());
    }
}
