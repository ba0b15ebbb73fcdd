use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::engine::{BroadcastPolicy, Broadcaster, DeliveryReport};
use crate::broker::gate::ClientGates;
use crate::broker::lifecycle::{CloseOutcome, Lifecycle, LifecycleSettings, OpenOutcome};
use crate::broker::message::Message;
use crate::client::{Connection, ConnectionRegistry};
use crate::config::HubSettings;
use crate::persistence::{ClientId, MembershipStore, TopicName};
use crate::utils::error::HubError;

/// Entry point for everything above the membership core.
///
/// Owns the connection registry and shares the membership store with the
/// lifecycle coordinator and the broadcaster. Construct one per process and
/// pass it around behind an `Arc`.
#[derive(Debug)]
pub struct Hub {
    store: Arc<dyn MembershipStore>,
    registry: Arc<ConnectionRegistry>,
    lifecycle: Lifecycle,
    broadcaster: Broadcaster,
    topic_ttl: Option<Duration>,
}

impl Hub {
    pub fn new(store: Arc<dyn MembershipStore>, settings: &HubSettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let gates = Arc::new(ClientGates::new());
        let lifecycle = Lifecycle::new(
            store.clone(),
            registry.clone(),
            gates.clone(),
            LifecycleSettings {
                session_policy: settings.session_policy,
                default_topics: settings.default_topics.clone(),
                topic_ttl: settings.topic_ttl(),
                restore_memberships: settings.restore_memberships,
            },
        );
        let broadcaster = Broadcaster::new(
            store.clone(),
            registry.clone(),
            gates,
            BroadcastPolicy {
                send_timeout: settings.send_timeout(),
                evict_on_timeout: settings.evict_on_timeout,
            },
        );

        Self {
            store,
            registry,
            lifecycle,
            broadcaster,
            topic_ttl: settings.topic_ttl(),
        }
    }

    /// A transport connection opened for `client_id`.
    pub async fn on_open(
        &self,
        client_id: &str,
        connection: Connection,
    ) -> Result<OpenOutcome, HubError> {
        self.lifecycle.on_open(client_id, connection).await
    }

    /// A transport connection closed. Duplicate closes are no-ops.
    pub async fn on_close(&self, connection_id: &str) -> Result<CloseOutcome, HubError> {
        self.lifecycle.on_close(connection_id).await
    }

    /// Re-runs the disconnect cascade for a client with no live connection.
    pub async fn purge_client(&self, client_id: &str) -> Result<Vec<TopicName>, HubError> {
        self.lifecycle.purge_client(client_id).await
    }

    /// Adds `client_id` to `topic`. Without an explicit `ttl` the configured
    /// topic TTL applies.
    pub async fn join(
        &self,
        topic: &str,
        client_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), HubError> {
        self.store
            .join(topic, client_id, ttl.or(self.topic_ttl))
            .await?;
        tracing::debug!(topic, client_id, "joined topic");
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str, client_id: &str) -> Result<(), HubError> {
        self.join(topic, client_id, None).await
    }

    pub async fn leave(&self, topic: &str, client_id: &str) -> Result<(), HubError> {
        self.store.leave(topic, client_id).await?;
        tracing::debug!(topic, client_id, "left topic");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str, client_id: &str) -> Result<(), HubError> {
        self.leave(topic, client_id).await
    }

    /// Broadcasts `msg` to every live member of `msg.topic`.
    pub async fn publish(&self, msg: &Message) -> Result<DeliveryReport, HubError> {
        let frame = msg.to_frame()?;
        self.broadcaster.publish(&msg.topic, frame).await
    }

    /// Broadcasts `payload` to `topic`, stamped with the current time.
    pub async fn broadcast_to_topic(
        &self,
        topic: &str,
        payload: &str,
    ) -> Result<DeliveryReport, HubError> {
        self.publish(&Message::new(topic, payload)).await
    }

    pub async fn members(&self, topic: &str) -> Result<HashSet<ClientId>, HubError> {
        Ok(self.store.members(topic).await?)
    }

    pub async fn topics_of(&self, client_id: &str) -> Result<HashSet<TopicName>, HubError> {
        Ok(self.store.topics_of(client_id).await?)
    }

    pub async fn is_member(&self, topic: &str, client_id: &str) -> Result<bool, HubError> {
        Ok(self.store.is_member(topic, client_id).await?)
    }

    /// Live connections of `client_id`.
    pub fn connections(&self, client_id: &str) -> Vec<Connection> {
        self.registry.lookup(client_id)
    }

    /// Client owning `connection_id`, if it is registered.
    pub fn client_for(&self, connection_id: &str) -> Option<ClientId> {
        self.registry.reverse_lookup(connection_id)
    }

    /// Logs both membership indices and registry counters at debug level.
    pub async fn log_state(&self) -> Result<(), HubError> {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return Ok(());
        }
        let topics = self.store.topics_with_members().await?;
        let members = self.store.members_with_topics().await?;
        tracing::debug!(
            clients = self.registry.client_count(),
            connections = self.registry.connection_count(),
            ?topics,
            ?members,
            "current hub state"
        );
        Ok(())
    }
}
