//! Persisted cluster membership records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ring::NodeStatus;

/// The failure detector's view of a node.
///
/// Distinct from [`NodeStatus`], which is the ring's view: a suspect node
/// still serves keys, a dead one does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl MemberState {
    /// The string persisted in the store. Kept as plain strings so clients
    /// in other languages sharing the namespace can parse them.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Alive => "alive",
            MemberState::Suspect => "suspect",
            MemberState::Dead => "dead",
        }
    }

    /// Map this state onto the ring's view of the node.
    ///
    /// Alive and suspect nodes keep serving keys; only dead nodes are
    /// taken out of rotation.
    pub fn ring_status(self) -> NodeStatus {
        match self {
            MemberState::Alive | MemberState::Suspect => NodeStatus::Active,
            MemberState::Dead => NodeStatus::Inactive,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(MemberState::Alive),
            "suspect" => Ok(MemberState::Suspect),
            "dead" => Ok(MemberState::Dead),
            _ => Err(Error::FieldMissing("state")),
        }
    }
}

/// A node as persisted in the store.
///
/// `address` already carries the port (`"host:port"`, as written by
/// [`Store::add_node`](crate::store::Store::add_node)); the health probe URL
/// is `{address}/{path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Unique identifier for the node.
    pub id: String,
    /// Probe address including the port.
    pub address: String,
    /// Path of the health endpoint on the node.
    pub path: String,
    /// Unix seconds at which the node joined the cluster.
    pub joined_at_unix: i64,
    /// Unix seconds of the last successful heartbeat.
    pub last_heartbeat_unix: i64,
    /// Total heartbeat probes issued to this node.
    pub heartbeat_count: u64,
    /// Consecutive failed probes since the last success.
    pub heartbeat_failures: u64,
    /// The failure detector's view of the node.
    pub state: MemberState,
}

impl Member {
    /// The URL probed by the failure detector.
    pub fn probe_url(&self) -> String {
        format!("{}/{}", self.address, self.path)
    }
}
