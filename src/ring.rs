//! Consistent hash ring with virtual nodes.
//!
//! [`HashRing`] is the plain data structure: each physical node is projected
//! onto `replica_count` positions of a u32 ring (CRC32-IEEE of `"{id}:{i}"`),
//! and a key is owned by the first virtual node clockwise of the key's own
//! hash. [`SharedRing`] wraps it for concurrent use: writers are serialised
//! through a mutex-guarded master copy and every completed mutation publishes
//! an immutable snapshot, so readers never observe a half-applied change.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The ring's view of a node's eligibility to serve keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Operational and available for key placement.
    Active,
    /// Not operational; routed around.
    Inactive,
    /// Preparing to be removed; routed around.
    Draining,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Draining => "draining",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical node on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Network address, opaque to the ring.
    pub address: String,
    /// Current operational status.
    pub status: NodeStatus,
    /// Unix timestamp of the last heartbeat received. Advisory.
    pub last_heartbeat_unix: i64,
}

impl Node {
    /// Create a new active node.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            status: NodeStatus::Active,
            last_heartbeat_unix: 0,
        }
    }

    /// Whether the node is available to handle keys.
    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Consistent hash ring mapping keys to nodes.
///
/// With `replica_count` virtual nodes per physical node, adding or removing
/// one of N nodes reassigns roughly 1/N of the keys, and the load spread
/// tightens as the replica count grows.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Physical nodes keyed by id.
    nodes: HashMap<String, Node>,
    /// Virtual node hash -> owning node id. On a CRC32 collision the most
    /// recently inserted virtual node wins.
    virtual_nodes: HashMap<u32, String>,
    /// Sorted virtual node positions. Length is replica_count x node count;
    /// duplicates are kept on collision.
    sorted_hashes: Vec<u32>,
    replica_count: usize,
}

impl HashRing {
    /// Create an empty ring with the given number of virtual nodes per
    /// physical node.
    pub fn new(replica_count: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            virtual_nodes: HashMap::new(),
            sorted_hashes: Vec::new(),
            replica_count: replica_count.max(1),
        }
    }

    /// Add a node to the ring.
    ///
    /// # Errors
    ///
    /// `InvalidNode` if the node id is empty, `AlreadyExists` if a node with
    /// this id is already registered.
    pub fn add_node(&mut self, node: Node) -> Result<(), Error> {
        if node.id.is_empty() {
            return Err(Error::InvalidNode);
        }
        if self.nodes.contains_key(&node.id) {
            return Err(Error::AlreadyExists(node.id));
        }

        for i in 0..self.replica_count {
            let hash = virtual_node_hash(&node.id, i);
            self.virtual_nodes.insert(hash, node.id.clone());
            self.sorted_hashes.push(hash);
        }
        self.sorted_hashes.sort_unstable();

        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node and all of its virtual nodes.
    ///
    /// # Errors
    ///
    /// `NotFound` if no node with this id is registered.
    pub fn remove_node(&mut self, node_id: &str) -> Result<(), Error> {
        let node = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| Error::NotFound(node_id.to_string()))?;

        for i in 0..self.replica_count {
            let hash = virtual_node_hash(&node.id, i);
            // On a collision the map entry may belong to another node; only
            // drop it when it still points at the removed node.
            if self.virtual_nodes.get(&hash).map(String::as_str) == Some(node_id) {
                self.virtual_nodes.remove(&hash);
            }
            if let Some(pos) = self.sorted_hashes.iter().position(|&h| h == hash) {
                self.sorted_hashes.remove(pos);
            }
        }
        Ok(())
    }

    /// Return the node responsible for `key`.
    ///
    /// The key's CRC32 position is matched to the first virtual node
    /// clockwise (wrapping); if that node is not active, the scan continues
    /// clockwise past virtual nodes of the same physical node until an
    /// active node is found.
    ///
    /// # Errors
    ///
    /// `EmptyRing` if no nodes are registered, `NoActiveNodes` if none of
    /// the registered nodes is active.
    pub fn get_node(&self, key: &str) -> Result<&Node, Error> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyRing);
        }

        let hash = crc32fast::hash(key.as_bytes());
        let mut idx = self.sorted_hashes.partition_point(|&h| h < hash);
        if idx >= self.sorted_hashes.len() {
            idx = 0;
        }

        let mut previous: Option<&str> = None;
        for i in 0..self.sorted_hashes.len() {
            let pos = (idx + i) % self.sorted_hashes.len();
            let Some(owner) = self.virtual_nodes.get(&self.sorted_hashes[pos]) else {
                continue;
            };
            // Consecutive virtual nodes of the same physical node are one
            // candidate, not several.
            if previous == Some(owner.as_str()) {
                continue;
            }
            previous = Some(owner);
            if let Some(node) = self.nodes.get(owner) {
                if node.is_available() {
                    return Ok(node);
                }
            }
        }

        Err(Error::NoActiveNodes)
    }

    /// Snapshot of all nodes, in no particular order.
    pub fn get_nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of virtual nodes in the ring.
    pub fn virtual_node_count(&self) -> usize {
        self.sorted_hashes.len()
    }

    /// Whether a node with this id is registered.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Update a node's status in place.
    ///
    /// # Errors
    ///
    /// `NotFound` if no node with this id is registered.
    pub fn update_node_status(&mut self, node_id: &str, status: NodeStatus) -> Result<(), Error> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(node_id.to_string()))?;
        node.status = status;
        Ok(())
    }

    #[cfg(test)]
    fn sorted_hashes(&self) -> &[u32] {
        &self.sorted_hashes
    }
}

/// Position of virtual node `index` of `node_id` on the ring.
fn virtual_node_hash(node_id: &str, index: usize) -> u32 {
    crc32fast::hash(format!("{node_id}:{index}").as_bytes())
}

/// Concurrent wrapper around [`HashRing`].
///
/// Writers mutate a mutex-guarded master copy and publish a full snapshot on
/// success; readers load the latest snapshot without taking any lock, so
/// lookups proceed concurrently with membership changes and always see
/// either the pre- or post-mutation ring.
pub(crate) struct SharedRing {
    current: ArcSwap<HashRing>,
    master: Mutex<HashRing>,
}

impl SharedRing {
    pub(crate) fn new(replica_count: usize) -> Self {
        let ring = HashRing::new(replica_count);
        Self {
            current: ArcSwap::from_pointee(ring.clone()),
            master: Mutex::new(ring),
        }
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut HashRing) -> Result<T, Error>) -> Result<T, Error> {
        let mut master = self.master.lock().expect("ring lock poisoned");
        let out = op(&mut master)?;
        self.current.store(Arc::new(master.clone()));
        Ok(out)
    }

    pub(crate) fn add_node(&self, node: Node) -> Result<(), Error> {
        self.mutate(|ring| ring.add_node(node))
    }

    pub(crate) fn remove_node(&self, node_id: &str) -> Result<(), Error> {
        self.mutate(|ring| ring.remove_node(node_id))
    }

    pub(crate) fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), Error> {
        self.mutate(|ring| ring.update_node_status(node_id, status))
    }

    pub(crate) fn get_node(&self, key: &str) -> Result<Node, Error> {
        self.current.load().get_node(key).cloned()
    }

    pub(crate) fn get_nodes(&self) -> Vec<Node> {
        self.current.load().get_nodes()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.current.load().node_count()
    }

    pub(crate) fn contains(&self, node_id: &str) -> bool {
        self.current.load().contains(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(id: &str) -> Node {
        Node::new(id, format!("http://{id}.example:80"))
    }

    #[test]
    fn test_add_node_rejects_empty_id() {
        let mut ring = HashRing::new(10);
        assert!(matches!(ring.add_node(active("")), Err(Error::InvalidNode)));
    }

    #[test]
    fn test_add_node_rejects_duplicate() {
        let mut ring = HashRing::new(10);
        ring.add_node(active("A")).unwrap();
        assert!(matches!(
            ring.add_node(active("A")),
            Err(Error::AlreadyExists(id)) if id == "A"
        ));
    }

    #[test]
    fn test_remove_unknown_node() {
        let mut ring = HashRing::new(10);
        assert!(matches!(
            ring.remove_node("missing"),
            Err(Error::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_ring_shape_through_add_remove_sequence() {
        let mut ring = HashRing::new(10);

        for (i, id) in ["A", "B", "C", "D"].iter().enumerate() {
            ring.add_node(active(id)).unwrap();
            assert_eq!(ring.node_count(), i + 1);
            assert_eq!(ring.virtual_node_count(), 10 * (i + 1));
            assert!(ring.sorted_hashes().windows(2).all(|w| w[0] <= w[1]));
        }

        ring.remove_node("B").unwrap();
        ring.remove_node("D").unwrap();
        assert_eq!(ring.node_count(), 2);
        assert_eq!(ring.virtual_node_count(), 20);
        assert!(ring.sorted_hashes().windows(2).all(|w| w[0] <= w[1]));

        // Every remaining position maps back to a live node.
        for hash in ring.sorted_hashes() {
            let owner = ring.virtual_nodes.get(hash).unwrap();
            assert!(owner == "A" || owner == "C");
        }
    }

    #[test]
    fn test_get_node_on_empty_ring() {
        let ring = HashRing::new(10);
        assert!(matches!(ring.get_node("key"), Err(Error::EmptyRing)));
    }

    #[test]
    fn test_single_node_owns_every_key() {
        let mut ring = HashRing::new(10);
        ring.add_node(active("A")).unwrap();
        for i in 0..100 {
            assert_eq!(ring.get_node(&format!("key-{i}")).unwrap().id, "A");
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let mut ring = HashRing::new(10);
        ring.add_node(active("A")).unwrap();
        ring.add_node(active("B")).unwrap();

        let first = ring.get_node("some-key").unwrap().id.clone();
        for _ in 0..20 {
            assert_eq!(ring.get_node("some-key").unwrap().id, first);
        }
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut forward = HashRing::new(10);
        let mut reverse = HashRing::new(10);
        for id in ["A", "B", "C"] {
            forward.add_node(active(id)).unwrap();
        }
        for id in ["C", "B", "A"] {
            reverse.add_node(active(id)).unwrap();
        }

        for i in 0..1000 {
            let key = format!("key-{i}");
            assert_eq!(
                forward.get_node(&key).unwrap().id,
                reverse.get_node(&key).unwrap().id,
                "key {key} must have the same owner regardless of insertion order"
            );
        }
    }

    #[test]
    fn test_three_node_balance() {
        let mut ring = HashRing::new(100);
        for id in ["A", "B", "C"] {
            ring.add_node(active(id)).unwrap();
        }

        let total = 10_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..total {
            let owner = ring.get_node(&format!("key-{i}")).unwrap().id.clone();
            *counts.entry(owner).or_default() += 1;
        }

        // Within +/-25% of an even three-way split.
        for id in ["A", "B", "C"] {
            let count = counts.get(id).copied().unwrap_or(0);
            assert!(
                (2500..=4167).contains(&count),
                "node {id} owns {count} of {total} keys, outside the expected band"
            );
        }
    }

    #[test]
    fn test_remove_node_moves_only_its_keys() {
        let mut ring = HashRing::new(100);
        for id in ["A", "B", "C"] {
            ring.add_node(active(id)).unwrap();
        }

        let keys: Vec<String> = (0..10_000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.get_node(k).unwrap().id.clone())
            .collect();

        ring.remove_node("B").unwrap();

        for (key, owner_before) in keys.iter().zip(&before) {
            let owner_after = &ring.get_node(key).unwrap().id;
            if owner_before != "B" {
                assert_eq!(
                    owner_before, owner_after,
                    "key {key} moved although its owner was not removed"
                );
            } else {
                assert_ne!(owner_after, "B");
            }
        }
    }

    #[test]
    fn test_inactive_node_is_routed_around() {
        let mut ring = HashRing::new(100);
        for id in ["A", "B", "C"] {
            ring.add_node(active(id)).unwrap();
        }
        ring.update_node_status("B", NodeStatus::Inactive).unwrap();

        for i in 0..2000 {
            let owner = &ring.get_node(&format!("key-{i}")).unwrap().id;
            assert_ne!(owner, "B");
        }
    }

    #[test]
    fn test_draining_node_is_routed_around() {
        let mut ring = HashRing::new(10);
        ring.add_node(active("A")).unwrap();
        ring.add_node(active("B")).unwrap();
        ring.update_node_status("A", NodeStatus::Draining).unwrap();

        for i in 0..200 {
            assert_eq!(ring.get_node(&format!("key-{i}")).unwrap().id, "B");
        }
    }

    #[test]
    fn test_all_nodes_inactive() {
        let mut ring = HashRing::new(10);
        ring.add_node(active("A")).unwrap();
        ring.add_node(active("B")).unwrap();
        ring.update_node_status("A", NodeStatus::Inactive).unwrap();
        ring.update_node_status("B", NodeStatus::Inactive).unwrap();

        assert!(matches!(ring.get_node("key"), Err(Error::NoActiveNodes)));
    }

    #[test]
    fn test_any_active_node_is_always_found() {
        let mut ring = HashRing::new(10);
        for id in ["A", "B", "C", "D"] {
            ring.add_node(active(id)).unwrap();
        }
        for id in ["A", "B", "D"] {
            ring.update_node_status(id, NodeStatus::Inactive).unwrap();
        }

        for i in 0..500 {
            assert_eq!(ring.get_node(&format!("key-{i}")).unwrap().id, "C");
        }
    }

    #[test]
    fn test_update_status_unknown_node() {
        let mut ring = HashRing::new(10);
        assert!(matches!(
            ring.update_node_status("ghost", NodeStatus::Inactive),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_shared_ring_publishes_after_mutation() {
        let shared = SharedRing::new(10);
        shared.add_node(active("A")).unwrap();

        assert_eq!(shared.node_count(), 1);
        assert!(shared.contains("A"));
        assert_eq!(shared.get_node("key").unwrap().id, "A");

        shared.update_node_status("A", NodeStatus::Inactive).unwrap();
        assert!(matches!(shared.get_node("key"), Err(Error::NoActiveNodes)));

        shared.remove_node("A").unwrap();
        assert_eq!(shared.node_count(), 0);
        assert!(matches!(shared.get_node("key"), Err(Error::EmptyRing)));
    }

    #[test]
    fn test_shared_ring_failed_mutation_leaves_snapshot_untouched() {
        let shared = SharedRing::new(10);
        shared.add_node(active("A")).unwrap();

        assert!(shared.add_node(active("A")).is_err());
        assert_eq!(shared.node_count(), 1);
        assert_eq!(shared.get_nodes().len(), 1);
    }
}
