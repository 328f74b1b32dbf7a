//! Cluster membership and key distribution over a shared Redis namespace.
//!
//! This crate provides:
//! - Consistent hashing with virtual nodes (CRC32 positions, minimal key
//!   remapping when membership changes)
//! - HTTP health probing with an `alive -> suspect -> dead -> alive` state
//!   machine per node
//! - Durable membership, heartbeat counters, and key->node mappings in an
//!   external Redis-shaped store, shared with other processes in the same
//!   namespace
//! - A bounded cluster event channel (`started`, `joined`, `left`, `died`,
//!   `revived`) with backpressure instead of event loss
//!
//! The store client and the HTTP client are injected; for tests and
//! single-process setups [`MemoryKv`] keeps everything in memory.
//!
//! Run exactly one coordinator per `{prefix}:{name}` namespace. Multiple
//! coordinators sharing a namespace will race each other's probes and
//! double-count heartbeats.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pantheon::{Coordinator, Options, RedisKv};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kv = Arc::new(RedisKv::connect("redis://127.0.0.1:6379").await?);
//!     let http = reqwest::Client::builder()
//!         .redirect(reqwest::redirect::Policy::none())
//!         .build()?;
//!
//!     let coordinator = Coordinator::new(
//!         Options::new()
//!             .with_name("workers")
//!             .with_heartbeat_interval(Duration::from_secs(10))
//!             .with_heartbeat_timeout(Duration::from_secs(2))
//!             .with_kv_client(kv)
//!             .with_http_client(http),
//!     )?;
//!     let mut events = coordinator.take_events().expect("events not taken yet");
//!
//!     coordinator.start().await?;
//!     coordinator.join("worker-1", "http://10.0.0.5", 8080, "healthz").await?;
//!     coordinator.distribute(&["tenant-42".to_string()]).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("cluster event: {event:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod coordinator;
mod error;
mod event;
mod heartbeat;
mod kv;
mod member;
mod options;
mod ring;
mod store;

pub use coordinator::Coordinator;
pub use error::Error;
pub use event::ClusterEvent;
pub use kv::{KvClient, MemoryKv, RedisKv};
pub use member::{Member, MemberState};
pub use options::Options;
pub use ring::{HashRing, Node, NodeStatus};
pub use store::Store;
