//! Public cluster events.

use serde::{Deserialize, Serialize};

/// Membership change event emitted on the coordinator's event channel.
///
/// The channel is bounded: consumers must drain it, otherwise the failure
/// detector is backpressured rather than events being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "node_id", rename_all = "lowercase")]
pub enum ClusterEvent {
    /// The coordinator has started.
    Started,
    /// A node joined the cluster.
    Joined(String),
    /// A node left the cluster gracefully.
    Left(String),
    /// A node was declared dead by the failure detector.
    Died(String),
    /// A previously suspect or dead node answered a probe again.
    Revived(String),
}

impl ClusterEvent {
    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ClusterEvent::Started => None,
            ClusterEvent::Joined(id)
            | ClusterEvent::Left(id)
            | ClusterEvent::Died(id)
            | ClusterEvent::Revived(id) => Some(id),
        }
    }
}
