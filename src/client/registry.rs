use std::collections::HashMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;

use super::connection::{Connection, ConnectionId};
use crate::persistence::ClientId;
use crate::utils::error::HubError;

/// What happens when a client opens a connection while it already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Existing connections are closed and evicted before the new one is installed.
    Single,
    /// The new connection is added next to the existing ones.
    #[default]
    Multi,
}

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub client_id: ClientId,
    /// The client has no connections left.
    pub last: bool,
}

/// In-process map from client identity to live connections, plus the
/// reverse map from connection id to client identity.
///
/// Mutations take the client entry before touching the reverse map and
/// never the other way round. All bookkeeping is synchronous.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, HashMap<ConnectionId, Connection>>,
    owners: DashMap<ConnectionId, ClientId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `connection` with `client_id` under `policy`.
    ///
    /// Returns the connections evicted by single-session policy; they are
    /// already closed. Fails with `HubError::Conflict` when the connection id
    /// is registered to a different client.
    pub fn register(
        &self,
        client_id: &str,
        connection: Connection,
        policy: SessionPolicy,
    ) -> Result<Vec<Connection>, HubError> {
        let mut entry = self.clients.entry(client_id.to_string()).or_default();

        let claimed = match self.owners.entry(connection.id.clone()) {
            Entry::Occupied(owner) if owner.get().as_str() != client_id => Err(owner.get().clone()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(client_id.to_string());
                Ok(())
            }
        };
        if let Err(owner) = claimed {
            let untouched = entry.is_empty();
            drop(entry);
            if untouched {
                self.clients.remove_if(client_id, |_, conns| conns.is_empty());
            }
            return Err(HubError::Conflict {
                connection_id: connection.id.clone(),
                owner,
                requested: client_id.to_string(),
            });
        }

        let mut evicted = Vec::new();
        if policy == SessionPolicy::Single {
            let stale: Vec<ConnectionId> = entry
                .keys()
                .filter(|id| **id != connection.id)
                .cloned()
                .collect();
            for id in stale {
                if let Some(old) = entry.remove(&id) {
                    self.owners.remove(&id);
                    old.close();
                    evicted.push(old);
                }
            }
        }

        tracing::debug!(
            client_id,
            connection_id = %connection.id,
            evicted = evicted.len(),
            "connection registered"
        );
        entry.insert(connection.id.clone(), connection);
        Ok(evicted)
    }

    /// Removes `connection_id` from whichever client owns it.
    pub fn unregister(&self, connection_id: &str) -> Option<Unregistered> {
        let client_id = self.reverse_lookup(connection_id)?;

        match self.clients.entry(client_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().remove(connection_id).is_none() {
                    return None;
                }
                self.owners.remove(connection_id);
                let last = entry.get().is_empty();
                if last {
                    entry.remove();
                }
                Some(Unregistered { client_id, last })
            }
            Entry::Vacant(_) => {
                self.owners.remove(connection_id);
                None
            }
        }
    }

    /// Live connections of `client_id`; empty when the client is unknown.
    pub fn lookup(&self, client_id: &str) -> Vec<Connection> {
        self.clients
            .get(client_id)
            .map(|conns| {
                conns
                    .values()
                    .filter(|conn| !conn.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn reverse_lookup(&self, connection_id: &str) -> Option<ClientId> {
        self.owners
            .get(connection_id)
            .map(|owner| owner.value().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }
}
