//! The `persistence` module holds the topic membership store: the
//! bidirectional index between topics and the client identities subscribed
//! to them.
//!
//! Two backends share one contract. `MemoryStore` keeps both indices in
//! process-local concurrent maps; `SledStore` keeps them in an embedded
//! `sled` database so membership survives restarts, committing both sides of
//! every edge in a single transaction.

pub mod keys;
pub mod memory;
pub mod sled_store;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::StoreSettings;
use crate::utils::error::StoreError;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

pub type ClientId = String;
pub type TopicName = String;

/// Bidirectional topic <-> client membership index.
///
/// For every topic `t` and client `c`, `c ∈ members(t)` exactly when
/// `t ∈ topics_of(c)`. Implementations must uphold this after every `join`
/// and `leave`, including under concurrent calls.
#[async_trait]
pub trait MembershipStore: Send + Sync + Debug {
    /// Adds the edge `(topic, client_id)`. Idempotent. With a `ttl` both
    /// keys get their expiry reset.
    async fn join(
        &self,
        topic: &str,
        client_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Removes the edge `(topic, client_id)`. Missing edges are a no-op.
    async fn leave(&self, topic: &str, client_id: &str) -> Result<(), StoreError>;

    async fn members(&self, topic: &str) -> Result<HashSet<ClientId>, StoreError>;

    async fn topics_of(&self, client_id: &str) -> Result<HashSet<TopicName>, StoreError>;

    async fn is_member(&self, topic: &str, client_id: &str) -> Result<bool, StoreError>;

    /// Every non-empty topic with its members.
    async fn topics_with_members(&self)
    -> Result<HashMap<TopicName, HashSet<ClientId>>, StoreError>;

    /// Every client with at least one topic.
    async fn members_with_topics(&self)
    -> Result<HashMap<ClientId, HashSet<TopicName>>, StoreError>;
}

/// Which backend holds membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sled,
}

/// Opens the backend selected by configuration.
pub fn open_store(settings: &StoreSettings) -> Result<Arc<dyn MembershipStore>, StoreError> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sled => Ok(Arc::new(SledStore::open(&settings.path)?)),
    }
}

#[cfg(test)]
mod tests;
