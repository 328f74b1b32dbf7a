//! The coordinator façade tying ring, store, and failure detector together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::event::ClusterEvent;
use crate::heartbeat::HeartbeatEvent;
use crate::member::MemberState;
use crate::options::Options;
use crate::ring::{Node, SharedRing};
use crate::store::Store;

/// Capacity of the public cluster event channel. A full channel
/// backpressures the failure detector instead of dropping events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the internal heartbeat event channel.
const HEARTBEAT_CHANNEL_CAPACITY: usize = 16;

/// How long `destroy` waits for background tasks before aborting them.
const DESTROY_GRACE: Duration = Duration::from_secs(5);

// Lifecycle states. A destroyed coordinator cannot be restarted.
const CREATED: u8 = 0;
const STARTED: u8 = 1;
const DESTROYED: u8 = 2;

/// State shared between the coordinator façade and its background tasks.
pub(crate) struct Core {
    pub(crate) store: Store,
    pub(crate) ring: SharedRing,
    pub(crate) http: reqwest::Client,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) heartbeat_concurrency: usize,
    pub(crate) heartbeat_max_failures: u64,
    pub(crate) heartbeat_tx: mpsc::Sender<HeartbeatEvent>,
    /// Taken (and thereby closed) on destroy.
    pub(crate) events_tx: Mutex<Option<mpsc::Sender<ClusterEvent>>>,
    pub(crate) cancel: CancellationToken,
}

impl Core {
    /// Publish a cluster event, honouring shutdown.
    pub(crate) async fn emit(&self, event: ClusterEvent) {
        let sender = self
            .events_tx
            .lock()
            .expect("event channel lock poisoned")
            .clone();
        let Some(sender) = sender else {
            return;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = sender.send(event) => {
                if result.is_err() {
                    debug!("cluster event channel closed");
                }
            }
        }
    }

    /// Place each key on the ring and persist both mapping directions.
    pub(crate) async fn distribute_keys(&self, keys: &[String]) -> Result<(), Error> {
        if self.ring.node_count() == 0 {
            return Err(Error::EmptyRing);
        }

        let mut assigned: HashMap<String, usize> = HashMap::new();
        for key in keys {
            let node = self.ring.get_node(key)?;
            self.store.set_key_node(key, &node.id).await?;
            self.store.add_node_key(&node.id, key).await?;
            *assigned.entry(node.id).or_default() += 1;
        }

        for (node_id, count) in &assigned {
            debug!(%node_id, count, "assigned keys");
        }
        Ok(())
    }
}

/// Cluster membership and key-distribution coordinator.
///
/// One coordinator instance owns its ring, store handle, HTTP client, and
/// background tasks. Exactly one coordinator per `{prefix}:{name}` namespace
/// is supported; concurrent coordinators in the same namespace race each
/// other's probes and counters.
pub struct Coordinator {
    core: Arc<Core>,
    lifecycle: AtomicU8,
    heartbeat_rx: Mutex<Option<mpsc::Receiver<HeartbeatEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build a coordinator from validated options.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if any option is unusable.
    pub fn new(options: Options) -> Result<Self, Error> {
        options.validate()?;
        let kv = options
            .kv
            .ok_or(Error::ConfigInvalid("store client is required"))?;
        let http = options
            .http
            .ok_or(Error::ConfigInvalid("http client is required"))?;
        let heartbeat_timeout = options
            .heartbeat_timeout
            .ok_or(Error::ConfigInvalid("heartbeat timeout is required"))?;

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let core = Core {
            store: Store::new(options.prefix, options.name, kv),
            ring: SharedRing::new(options.replica_count),
            http,
            heartbeat_interval: options.heartbeat_interval,
            heartbeat_timeout,
            heartbeat_concurrency: options.heartbeat_concurrency,
            heartbeat_max_failures: options.heartbeat_max_failures,
            heartbeat_tx,
            events_tx: Mutex::new(Some(events_tx)),
            cancel: CancellationToken::new(),
        };

        Ok(Self {
            core: Arc::new(core),
            lifecycle: AtomicU8::new(CREATED),
            heartbeat_rx: Mutex::new(Some(heartbeat_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Take the receiving end of the cluster event channel.
    ///
    /// Can be taken once. The channel is bounded: the consumer must keep
    /// draining it, otherwise the failure detector stalls rather than
    /// dropping events.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ClusterEvent>> {
        self.events_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take()
    }

    /// Start the coordinator: verify the store is reachable, rebuild the
    /// ring from the persisted member set, and spawn the probe loop and the
    /// event consumer.
    ///
    /// Idempotent; a second call on a running coordinator is a no-op.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store cannot be reached, `AlreadyStarted`
    /// if the coordinator was destroyed.
    pub async fn start(&self) -> Result<(), Error> {
        match self.lifecycle.load(Ordering::Acquire) {
            STARTED => return Ok(()),
            DESTROYED => return Err(Error::AlreadyStarted),
            _ => {}
        }

        self.core.store.ping().await?;
        self.rebuild_ring().await?;

        match self
            .lifecycle
            .compare_exchange(CREATED, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(STARTED) => return Ok(()),
            Err(_) => return Err(Error::AlreadyStarted),
        }

        let heartbeat_rx = self
            .heartbeat_rx
            .lock()
            .expect("heartbeat receiver lock poisoned")
            .take();
        if let Some(heartbeat_rx) = heartbeat_rx {
            let mut tasks = self.tasks.lock().await;
            tasks.push(tokio::spawn(
                Arc::clone(&self.core).run_event_consumer(heartbeat_rx),
            ));
            tasks.push(tokio::spawn(Arc::clone(&self.core).run_heartbeat_loop()));
        }

        info!(
            nodes = self.core.ring.node_count(),
            "coordinator started"
        );
        self.core.emit(ClusterEvent::Started).await;
        Ok(())
    }

    /// Rebuild the in-memory ring from the persisted member set. Dead
    /// members re-enter the ring as inactive so revival can restore them.
    async fn rebuild_ring(&self) -> Result<(), Error> {
        let members = self.core.store.get_nodes().await?;
        for member in members {
            let mut node = Node::new(member.id.clone(), member.address.clone());
            node.status = member.state.ring_status();
            node.last_heartbeat_unix = member.last_heartbeat_unix;
            match self.core.ring.add_node(node) {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Stop background work and close the public event channel.
    ///
    /// Idempotent. In-flight probes are cancelled; background tasks get a
    /// bounded grace period before being aborted. The coordinator cannot be
    /// restarted afterwards.
    pub async fn destroy(&self) {
        if self.lifecycle.swap(DESTROYED, Ordering::AcqRel) == DESTROYED {
            return;
        }

        self.core.cancel.cancel();
        // Dropping the sender closes the public channel once in-flight
        // emits have drained.
        self.core
            .events_tx
            .lock()
            .expect("event channel lock poisoned")
            .take();

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(DESTROY_GRACE, &mut task).await.is_err() {
                warn!("background task did not stop within the grace period, aborting");
                task.abort();
            }
        }
        info!("coordinator destroyed");
    }

    fn ensure_started(&self) -> Result<(), Error> {
        if self.lifecycle.load(Ordering::Acquire) == STARTED {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Add a node to the cluster and the ring, then probe it immediately.
    ///
    /// The stored probe address is `"{address}:{port}"`; the health URL is
    /// `{address}:{port}/{path}`.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `InvalidNode` for an empty id, `AlreadyExists` if the
    /// store already has a record for this id.
    pub async fn join(
        &self,
        node_id: &str,
        address: &str,
        port: u16,
        path: &str,
    ) -> Result<(), Error> {
        self.ensure_started()?;
        if node_id.is_empty() {
            return Err(Error::InvalidNode);
        }
        if self.core.store.get_node(node_id).await?.is_some() {
            return Err(Error::AlreadyExists(node_id.to_string()));
        }

        self.core.store.add_node(node_id, address, path, port).await?;

        let node = Node::new(node_id, format!("{address}:{port}"));
        if let Err(error) = self.core.ring.add_node(node) {
            // Undo the store write so the two sides stay consistent.
            if let Err(undo_error) = self.core.store.remove_node(node_id).await {
                warn!(%node_id, %undo_error, "failed to roll back member record");
            }
            return Err(error);
        }

        info!(%node_id, address, port, "node joined the cluster");
        self.core.emit(ClusterEvent::Joined(node_id.to_string())).await;

        // Check the new node's health right away instead of waiting for the
        // next tick.
        let core = Arc::clone(&self.core);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            match core.store.get_node(&node_id).await {
                Ok(Some(member)) => core.probe_and_publish(&member).await,
                Ok(None) => {}
                Err(error) => {
                    warn!(%node_id, %error, "failed to read member for initial probe")
                }
            }
        });

        Ok(())
    }

    /// Remove a node from the cluster.
    ///
    /// The node's key mappings are deleted along with its record; the keys
    /// are not redistributed automatically. Callers that want the departing
    /// node's keys re-placed immediately should collect them first via
    /// [`get_node_keys`](Self::get_node_keys) and pass them to
    /// [`distribute`](Self::distribute) afterwards; otherwise each key is
    /// re-bound lazily on its next lookup.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `NotFound` if the store has no record for this id.
    pub async fn leave(&self, node_id: &str) -> Result<(), Error> {
        self.ensure_started()?;
        if self.core.store.get_node(node_id).await?.is_none() {
            return Err(Error::NotFound(node_id.to_string()));
        }

        self.core.store.remove_node(node_id).await?;
        match self.core.ring.remove_node(node_id) {
            Ok(()) => {}
            // The store record is already gone; a missing ring entry is a
            // recoverable inconsistency, not a failure.
            Err(Error::NotFound(_)) => {
                warn!(%node_id, "node was missing from the ring on leave")
            }
            Err(error) => return Err(error),
        }

        info!(%node_id, "node left the cluster");
        self.core.emit(ClusterEvent::Left(node_id.to_string())).await;
        Ok(())
    }

    /// Assign each key to a node via the ring and persist both the forward
    /// (`key -> node`) and reverse (`node -> keys`) mappings.
    ///
    /// Safe to call concurrently with the failure detector.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `EmptyRing` if no nodes are registered,
    /// `NoActiveNodes` if no node can take keys.
    pub async fn distribute(&self, keys: &[String]) -> Result<(), Error> {
        self.ensure_started()?;
        debug!(count = keys.len(), "distributing keys");
        self.core.distribute_keys(keys).await
    }

    /// The keys currently owned by a node.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `NotFound` if the node is unknown to the ring.
    pub async fn get_node_keys(&self, node_id: &str) -> Result<Vec<String>, Error> {
        self.ensure_started()?;
        if !self.core.ring.contains(node_id) {
            return Err(Error::NotFound(node_id.to_string()));
        }
        self.core.store.get_node_keys(node_id).await
    }

    /// The node responsible for a key.
    ///
    /// Reads the persisted mapping if one exists; otherwise computes the
    /// owner via the ring and persists the new mapping before returning it,
    /// so an unmapped key resolves consistently on later lookups. Note that
    /// this makes the first lookup of a key a write.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `EmptyRing`, `NoActiveNodes`.
    pub async fn get_key_node(&self, key: &str) -> Result<String, Error> {
        self.ensure_started()?;
        if let Some(node_id) = self.core.store.get_key_node(key).await? {
            return Ok(node_id);
        }

        let node = self.core.ring.get_node(key)?;
        self.core.store.set_key_node(key, &node.id).await?;
        self.core.store.add_node_key(&node.id, key).await?;
        Ok(node.id)
    }

    /// The failure detector's view of a node.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `NotFound`.
    pub async fn get_node_health(&self, node_id: &str) -> Result<MemberState, Error> {
        self.ensure_started()?;
        let member = self
            .core
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(node_id.to_string()))?;
        Ok(member.state)
    }

    /// Reset a node's consecutive-failure counter to zero.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `NotFound`.
    pub async fn reset_node_failures(&self, node_id: &str) -> Result<(), Error> {
        self.ensure_started()?;
        if self.core.store.get_node(node_id).await?.is_none() {
            return Err(Error::NotFound(node_id.to_string()));
        }
        self.core.store.reset_heartbeat_failures(node_id).await
    }

    /// Probe a node once, outside the periodic schedule, and wait for the
    /// probe to complete. The outcome feeds the same state machine as
    /// scheduled probes.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `NotFound`.
    pub async fn ping_node(&self, node_id: &str) -> Result<(), Error> {
        self.ensure_started()?;
        let member = self
            .core
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(node_id.to_string()))?;
        self.core.probe_and_publish(&member).await;
        Ok(())
    }

    /// Snapshot of the ring's nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.core.ring.get_nodes()
    }

    /// Number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.core.ring.node_count()
    }
}
