//! Connection lifecycle
//!
//! Drives a client through `Unregistered -> Active(n) -> Unregistered`:
//! `on_open` registers a connection and seeds memberships, `on_close`
//! unregisters it and, when it was the client's last connection, removes the
//! client from every topic (the cascade).
//!
//! Transitions for one client are serialized by a per-client gate; different
//! clients never wait on each other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::gate::ClientGates;
use crate::client::{Connection, ConnectionId, ConnectionRegistry, SessionPolicy, Unregistered};
use crate::persistence::{ClientId, MembershipStore, TopicName};
use crate::utils::error::HubError;

#[derive(Debug, Clone, Default)]
pub struct LifecycleSettings {
    pub session_policy: SessionPolicy,
    /// Topics every client joins on open.
    pub default_topics: Vec<TopicName>,
    pub topic_ttl: Option<Duration>,
    /// Re-join (and so refresh) the memberships a client still has in the
    /// store when it opens a connection, e.g. after a server restart.
    pub restore_memberships: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOutcome {
    pub connection_id: ConnectionId,
    /// Connections closed by single-session policy.
    pub evicted: Vec<ConnectionId>,
    /// Memberships the client holds after seeding.
    pub topics: HashSet<TopicName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The connection was not registered, e.g. a duplicate close.
    Unknown,
    /// The client still has other connections.
    Detached { client_id: ClientId, remaining: usize },
    /// The last connection closed and the client left these topics.
    Departed {
        client_id: ClientId,
        left: Vec<TopicName>,
    },
}

#[derive(Debug)]
pub struct Lifecycle {
    store: Arc<dyn MembershipStore>,
    registry: Arc<ConnectionRegistry>,
    settings: LifecycleSettings,
    gates: Arc<ClientGates>,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        registry: Arc<ConnectionRegistry>,
        gates: Arc<ClientGates>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            gates,
        }
    }

    pub async fn on_open(
        &self,
        client_id: &str,
        connection: Connection,
    ) -> Result<OpenOutcome, HubError> {
        let gate = self.gates.lock(client_id).await;
        let result = self.open_locked(client_id, connection).await;
        self.gates.unlock(client_id, gate);
        result
    }

    pub async fn on_close(&self, connection_id: &str) -> Result<CloseOutcome, HubError> {
        let Some(client_id) = self.registry.reverse_lookup(connection_id) else {
            tracing::debug!(connection_id, "close for unknown connection ignored");
            return Ok(CloseOutcome::Unknown);
        };

        let gate = self.gates.lock(&client_id).await;
        let result = self.close_locked(connection_id).await;
        self.gates.unlock(&client_id, gate);
        result
    }

    /// Removes `client_id` from every topic if it has no live connection.
    ///
    /// Safe to call repeatedly; used to finish a cascade that failed part way.
    pub async fn purge_client(&self, client_id: &str) -> Result<Vec<TopicName>, HubError> {
        let gate = self.gates.lock(client_id).await;
        let result = if self.registry.lookup(client_id).is_empty() {
            self.cascade(client_id).await
        } else {
            Ok(Vec::new())
        };
        self.gates.unlock(client_id, gate);
        result
    }

    async fn open_locked(
        &self,
        client_id: &str,
        connection: Connection,
    ) -> Result<OpenOutcome, HubError> {
        let handle = connection.clone();
        let evicted = self
            .registry
            .register(client_id, connection, self.settings.session_policy)?;

        let topics = match self.seed(client_id).await {
            Ok(topics) => topics,
            Err(err) => {
                tracing::warn!(client_id, connection_id = %handle.id, error = %err, "seeding memberships failed, rolling back open");
                handle.close();
                if let Some(Unregistered { last: true, .. }) = self.registry.unregister(&handle.id) {
                    if let Err(cascade_err) = self.cascade(client_id).await {
                        tracing::warn!(client_id, error = %cascade_err, "cleanup after failed open incomplete");
                    }
                }
                return Err(err);
            }
        };

        tracing::info!(
            client_id,
            connection_id = %handle.id,
            connections = self.registry.lookup(client_id).len(),
            "client connected"
        );
        Ok(OpenOutcome {
            connection_id: handle.id,
            evicted: evicted.into_iter().map(|conn| conn.id).collect(),
            topics,
        })
    }

    async fn seed(&self, client_id: &str) -> Result<HashSet<TopicName>, HubError> {
        let ttl = self.settings.topic_ttl;

        if self.settings.restore_memberships {
            for topic in self.store.topics_of(client_id).await? {
                self.store.join(&topic, client_id, ttl).await?;
            }
        }
        for topic in &self.settings.default_topics {
            self.store.join(topic, client_id, ttl).await?;
        }

        Ok(self.store.topics_of(client_id).await?)
    }

    async fn close_locked(&self, connection_id: &str) -> Result<CloseOutcome, HubError> {
        match self.registry.unregister(connection_id) {
            None => Ok(CloseOutcome::Unknown),
            Some(Unregistered {
                client_id,
                last: false,
            }) => {
                let remaining = self.registry.lookup(&client_id).len();
                tracing::info!(client_id = %client_id, connection_id, remaining, "connection closed");
                Ok(CloseOutcome::Detached {
                    client_id,
                    remaining,
                })
            }
            Some(Unregistered {
                client_id,
                last: true,
            }) => {
                let left = self.cascade(&client_id).await?;
                tracing::info!(client_id = %client_id, connection_id, topics = left.len(), "client disconnected");
                Ok(CloseOutcome::Departed { client_id, left })
            }
        }
    }

    async fn cascade(&self, client_id: &str) -> Result<Vec<TopicName>, HubError> {
        let mut left = Vec::new();
        for topic in self.store.topics_of(client_id).await? {
            self.store.leave(&topic, client_id).await?;
            left.push(topic);
        }
        left.sort();
        Ok(left)
    }
}
