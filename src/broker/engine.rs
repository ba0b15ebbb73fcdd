//! Broadcast engine
//!
//! Resolves a topic's members to live connections and fans a frame out to
//! every one of them. Responsibilities:
//! - take a snapshot of the topic's members when the publish starts, so
//!   joins and leaves racing with the fan-out do not affect it
//! - send to every live connection concurrently, each send bounded by the
//!   configured timeout so one stuck socket cannot stall the rest
//! - evict members that turn out to be unreachable (self-healing), and
//!   report everything else instead of failing the publish
//!
//! Only a failure to read the member snapshot is returned as an error.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::gate::ClientGates;
use crate::client::{ConnectionId, ConnectionRegistry, DeliveryError};
use crate::persistence::{ClientId, MembershipStore};
use crate::utils::error::{HubError, StoreError};

/// Knobs for how deliveries are bounded and which failures evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPolicy {
    pub send_timeout: Duration,
    /// Evict a member whose every connection timed out. When false those
    /// members stay subscribed and the timeouts are reported as failures.
    pub evict_on_timeout: bool,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            evict_on_timeout: false,
        }
    }
}

/// Why a delivery to a member did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Delivery(DeliveryError),
    /// The member was due for eviction but the store rejected the leave.
    Eviction(String),
}

/// A failure that was absorbed rather than propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub client_id: ClientId,
    pub connection_id: Option<ConnectionId>,
    pub reason: FailureReason,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Members removed from the topic because they were unreachable.
    pub evicted: Vec<ClientId>,
    /// Failures for members that stay subscribed.
    pub failures: Vec<DeliveryFailure>,
}

type Attempt = (ConnectionId, Result<(), DeliveryError>);

/// Fans frames out to the members of a topic.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    store: Arc<dyn MembershipStore>,
    registry: Arc<ConnectionRegistry>,
    gates: Arc<ClientGates>,
    policy: BroadcastPolicy,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        registry: Arc<ConnectionRegistry>,
        gates: Arc<ClientGates>,
        policy: BroadcastPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            gates,
            policy,
        }
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Delivers `frame` to every live connection of every member of `topic`.
    pub async fn publish(&self, topic: &str, frame: WsMessage) -> Result<DeliveryReport, HubError> {
        let snapshot = self.store.members(topic).await?;
        let timeout = self.policy.send_timeout;

        let deliveries = snapshot.into_iter().map(|client_id| {
            let connections = self.registry.lookup(&client_id);
            let frame = frame.clone();
            async move {
                let attempts: Vec<Attempt> =
                    join_all(connections.iter().map(|conn| {
                        let frame = frame.clone();
                        async move { (conn.id.clone(), conn.send(frame, timeout).await) }
                    }))
                    .await;
                (client_id, attempts)
            }
        });
        let outcomes = join_all(deliveries).await;

        let mut report = DeliveryReport::default();
        for (client_id, attempts) in outcomes {
            let sent = attempts.iter().filter(|(_, res)| res.is_ok()).count();
            report.delivered += sent;

            if sent == 0 && self.should_evict(&attempts) {
                match self.evict(topic, &client_id, &attempts).await {
                    Ok(true) => {
                        report.evicted.push(client_id);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(topic, client_id = %client_id, error = %err, "failed to evict member");
                        report.failures.push(eviction_failure(client_id.clone(), &err));
                    }
                }
            }

            for (connection_id, res) in attempts {
                if let Err(err) = res {
                    tracing::warn!(topic, client_id = %client_id, connection_id = %connection_id, error = %err, "delivery failed");
                    report.failures.push(DeliveryFailure {
                        client_id: client_id.clone(),
                        connection_id: Some(connection_id),
                        reason: FailureReason::Delivery(err),
                    });
                }
            }
        }

        report.evicted.sort();
        tracing::debug!(
            topic,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            failures = report.failures.len(),
            "broadcast finished"
        );
        Ok(report)
    }

    /// Removes an unreachable member from `topic` under its client gate.
    ///
    /// Returns `false` without touching the store when a connection opened
    /// after the fan-out started, since that open may have restored the
    /// membership.
    async fn evict(
        &self,
        topic: &str,
        client_id: &str,
        attempts: &[Attempt],
    ) -> Result<bool, StoreError> {
        let gate = self.gates.lock(client_id).await;
        let reconnected = self
            .registry
            .lookup(client_id)
            .iter()
            .any(|conn| !attempts.iter().any(|(id, _)| *id == conn.id));
        let result = if reconnected {
            tracing::debug!(topic, client_id, "member reconnected during broadcast, keeping it");
            Ok(false)
        } else {
            self.store.leave(topic, client_id).await.map(|()| {
                tracing::info!(topic, client_id, "evicted unreachable member");
                true
            })
        };
        self.gates.unlock(client_id, gate);
        result
    }

    /// A member with no successful send is evicted when it has no live
    /// connection, every connection is closed, or timeouts evict by policy.
    fn should_evict(&self, attempts: &[Attempt]) -> bool {
        attempts.is_empty()
            || self.policy.evict_on_timeout
            || attempts
                .iter()
                .all(|(_, res)| matches!(res, Err(DeliveryError::Closed)))
    }
}

fn eviction_failure(client_id: ClientId, err: &StoreError) -> DeliveryFailure {
    DeliveryFailure {
        client_id,
        connection_id: None,
        reason: FailureReason::Eviction(err.to_string()),
    }
}
