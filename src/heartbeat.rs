//! Failure detector: periodic probe dispatch and the membership state
//! machine.
//!
//! Each tick reads the member set, fans probes out across a bounded pool,
//! and publishes one [`HeartbeatEvent`] per member on a bounded channel. A
//! single consumer applies all state transitions, so per-node transitions
//! are strictly serialised. A slow event consumer backpressures the probe
//! workers, which in turn delays the next tick; events are never dropped.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::coordinator::Core;
use crate::error::Error;
use crate::event::ClusterEvent;
use crate::member::{Member, MemberState};
use crate::ring::NodeStatus;

/// Outcome of one health probe.
#[derive(Debug)]
pub(crate) enum ProbeOutcome {
    /// The node answered with HTTP 200.
    Success,
    /// Transport error, non-200 status, or deadline exceeded.
    Failure(Error),
}

/// One probe result, published to the state-machine consumer.
#[derive(Debug)]
pub(crate) struct HeartbeatEvent {
    pub(crate) node_id: String,
    pub(crate) outcome: ProbeOutcome,
}

impl Core {
    /// Drive the periodic probe loop until shutdown.
    ///
    /// A tick that runs longer than the interval delays the next tick; ticks
    /// never overlap and missed ticks are not replayed in a burst.
    pub(crate) async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately; consume
        // it so probing starts one interval after startup.
        ticker.tick().await;

        debug!("heartbeat loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.perform_heartbeat().await;
                }
            }
        }
    }

    /// Probe every known member, at most `heartbeat_concurrency` at a time,
    /// and wait for all probes to finish.
    async fn perform_heartbeat(&self) {
        let members = match self.store.get_nodes().await {
            Ok(members) => members,
            Err(error) => {
                warn!(%error, "skipping heartbeat tick: could not read member set");
                return;
            }
        };

        stream::iter(members)
            .for_each_concurrent(self.heartbeat_concurrency, |member| async move {
                self.tick_probe(&member).await;
            })
            .await;
    }

    /// One tick's worth of work for a single member: count the probe, issue
    /// it, publish the outcome.
    async fn tick_probe(&self, member: &Member) {
        if let Err(error) = self.store.increment_heartbeats(&member.id).await {
            warn!(node_id = %member.id, %error, "failed to increment heartbeat count");
        }
        self.probe_and_publish(member).await;
    }

    /// Probe a member once and publish the outcome to the event channel.
    ///
    /// Used by the tick workers, by `Join`'s immediate check of a new node,
    /// and by `PingNode`. Cancelled probes publish nothing.
    pub(crate) async fn probe_and_publish(&self, member: &Member) {
        let url = member.probe_url();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return,
            outcome = self.probe(&url) => outcome,
        };
        if let ProbeOutcome::Failure(error) = &outcome {
            debug!(node_id = %member.id, %error, "health probe failed");
        }

        let event = HeartbeatEvent {
            node_id: member.id.clone(),
            outcome,
        };
        // A full channel blocks here, backpressuring the tick rather than
        // dropping the event.
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = self.heartbeat_tx.send(event) => {
                if result.is_err() {
                    debug!("heartbeat event channel closed");
                }
            }
        }
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        let response = self
            .http
            .get(url)
            .timeout(self.heartbeat_timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status() == reqwest::StatusCode::OK => ProbeOutcome::Success,
            Ok(response) => ProbeOutcome::Failure(Error::ProbeFailed {
                url: url.to_string(),
                reason: format!("unexpected status code {}", response.status().as_u16()),
            }),
            Err(error) => ProbeOutcome::Failure(Error::ProbeFailed {
                url: url.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    /// Consume heartbeat events until shutdown, applying the membership
    /// state machine one event at a time. Death transitions kick off key
    /// redistribution in a separate task so the state machine never stalls
    /// on it.
    pub(crate) async fn run_event_consumer(
        self: Arc<Self>,
        mut heartbeat_rx: tokio::sync::mpsc::Receiver<HeartbeatEvent>,
    ) {
        debug!("heartbeat event consumer started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("heartbeat event consumer shutting down");
                    break;
                }
                event = heartbeat_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(dead_node) = self.handle_heartbeat_event(event).await {
                        let core = Arc::clone(&self);
                        tokio::spawn(async move {
                            core.redistribute_node_keys(&dead_node).await;
                        });
                    }
                }
            }
        }
    }

    /// Apply one probe outcome to the membership state machine.
    ///
    /// Returns the node id when this event moved the node to `dead`, in
    /// which case the caller should redistribute the node's keys.
    pub(crate) async fn handle_heartbeat_event(&self, event: HeartbeatEvent) -> Option<String> {
        let member = match self.store.get_node(&event.node_id).await {
            Ok(Some(member)) => member,
            Ok(None) => {
                debug!(node_id = %event.node_id, "probed node is no longer in the store");
                return None;
            }
            Err(error) => {
                error!(node_id = %event.node_id, %error, "failed to read member for heartbeat event");
                return None;
            }
        };

        match event.outcome {
            ProbeOutcome::Success => {
                self.handle_probe_success(&member).await;
                None
            }
            ProbeOutcome::Failure(_) => self.handle_probe_failure(&member).await,
        }
    }

    async fn handle_probe_success(&self, member: &Member) {
        if let Err(error) = self.store.update_node_heartbeat(&member.id).await {
            error!(node_id = %member.id, %error, "failed to update heartbeat timestamp");
            return;
        }

        // Every success resets the consecutive-failure counter.
        if member.heartbeat_failures > 0 {
            if let Err(error) = self.store.reset_heartbeat_failures(&member.id).await {
                error!(node_id = %member.id, %error, "failed to reset failure count");
            }
        }

        if member.state != MemberState::Alive {
            if let Err(error) = self
                .store
                .update_node_state(&member.id, MemberState::Alive)
                .await
            {
                error!(node_id = %member.id, %error, "failed to update node state");
                return;
            }
            // The ring must route to the node again before the event is
            // observable.
            match self.ring.update_node_status(&member.id, NodeStatus::Active) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(error) => {
                    error!(node_id = %member.id, %error, "failed to update ring status")
                }
            }
            info!(node_id = %member.id, "node revived");
            self.emit(ClusterEvent::Revived(member.id.clone())).await;
        }
    }

    /// Returns the node id if the node transitioned to `dead`.
    async fn handle_probe_failure(&self, member: &Member) -> Option<String> {
        let failures = match self.store.increment_heartbeat_failures(&member.id).await {
            Ok(failures) => failures,
            Err(error) => {
                error!(node_id = %member.id, %error, "failed to increment failure count");
                return None;
            }
        };

        if failures >= self.heartbeat_max_failures {
            if member.state == MemberState::Dead {
                return None;
            }
            if let Err(error) = self
                .store
                .update_node_state(&member.id, MemberState::Dead)
                .await
            {
                error!(node_id = %member.id, %error, "failed to update node state");
                return None;
            }
            match self.ring.update_node_status(&member.id, NodeStatus::Inactive) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(error) => {
                    error!(node_id = %member.id, %error, "failed to update ring status")
                }
            }
            warn!(node_id = %member.id, failures, "node declared dead");
            self.emit(ClusterEvent::Died(member.id.clone())).await;
            Some(member.id.clone())
        } else {
            if member.state == MemberState::Alive {
                match self
                    .store
                    .update_node_state(&member.id, MemberState::Suspect)
                    .await
                {
                    Ok(()) => debug!(node_id = %member.id, failures, "node is suspect"),
                    Err(error) => {
                        error!(node_id = %member.id, %error, "failed to update node state")
                    }
                }
            }
            None
        }
    }

    /// Re-place every key owned by a dead node onto the remaining ring.
    ///
    /// The stale reverse-mapping entries of the dead node are left behind;
    /// the forward mapping is authoritative and gets overwritten here.
    pub(crate) async fn redistribute_node_keys(&self, node_id: &str) {
        let keys = match self.store.get_node_keys(node_id).await {
            Ok(keys) => keys,
            Err(error) => {
                error!(node_id, %error, "failed to read keys of dead node");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }

        info!(node_id, count = keys.len(), "redistributing keys of dead node");
        if let Err(error) = self.distribute_keys(&keys).await {
            error!(node_id, %error, "failed to redistribute keys of dead node");
        }
    }
}
