use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::keys;
use super::{ClientId, MembershipStore, TopicName};
use crate::utils::error::StoreError;

/// One side of the index: a set of names with an optional expiry.
#[derive(Debug, Default)]
struct KeySet {
    items: HashSet<String>,
    expires_at: Option<Instant>,
}

impl KeySet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn live(&self, now: Instant) -> Option<&HashSet<String>> {
        if self.is_expired(now) {
            None
        } else {
            Some(&self.items)
        }
    }

    fn insert(&mut self, item: &str, ttl: Option<Duration>, now: Instant) {
        if self.is_expired(now) {
            self.items.clear();
            self.expires_at = None;
        }
        self.items.insert(item.to_string());
        if let Some(ttl) = ttl {
            self.expires_at = Some(now + ttl);
        }
    }
}

/// Process-local membership store.
///
/// `join` and `leave` always take the topic entry first and the member entry
/// second and hold both until the edge is complete, so neither index can be
/// observed with half an edge. Readers only ever take one entry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: DashMap<TopicName, KeySet>,
    members: DashMap<ClientId, KeySet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            members: DashMap::new(),
        }
    }

    fn read(map: &DashMap<String, KeySet>, key: &str) -> HashSet<String> {
        let now = Instant::now();
        map.get(key)
            .and_then(|set| set.live(now).cloned())
            .unwrap_or_default()
    }

    fn dump(map: &DashMap<String, KeySet>) -> HashMap<String, HashSet<String>> {
        let now = Instant::now();
        map.iter()
            .filter_map(|entry| {
                entry
                    .live(now)
                    .filter(|items| !items.is_empty())
                    .map(|items| (entry.key().clone(), items.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn join(
        &self,
        topic: &str,
        client_id: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;

        let now = Instant::now();
        let mut members = self.topics.entry(topic.to_string()).or_default();
        let mut topics = self.members.entry(client_id.to_string()).or_default();
        members.insert(client_id, ttl, now);
        topics.insert(topic, ttl, now);
        Ok(())
    }

    async fn leave(&self, topic: &str, client_id: &str) -> Result<(), StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;

        {
            let members = self.topics.get_mut(topic);
            let topics = self.members.get_mut(client_id);
            if let Some(mut members) = members {
                members.items.remove(client_id);
            }
            if let Some(mut topics) = topics {
                topics.items.remove(topic);
            }
        }

        // Empty sets carry no edges, so dropping them after the locks are
        // released cannot break consistency.
        self.topics.remove_if(topic, |_, set| set.items.is_empty());
        self.members.remove_if(client_id, |_, set| set.items.is_empty());
        Ok(())
    }

    async fn members(&self, topic: &str) -> Result<HashSet<ClientId>, StoreError> {
        keys::validate(topic)?;
        Ok(Self::read(&self.topics, topic))
    }

    async fn topics_of(&self, client_id: &str) -> Result<HashSet<TopicName>, StoreError> {
        keys::validate(client_id)?;
        Ok(Self::read(&self.members, client_id))
    }

    async fn is_member(&self, topic: &str, client_id: &str) -> Result<bool, StoreError> {
        keys::validate(topic)?;
        keys::validate(client_id)?;
        let now = Instant::now();
        Ok(self
            .topics
            .get(topic)
            .and_then(|set| set.live(now).map(|items| items.contains(client_id)))
            .unwrap_or(false))
    }

    async fn topics_with_members(
        &self,
    ) -> Result<HashMap<TopicName, HashSet<ClientId>>, StoreError> {
        Ok(Self::dump(&self.topics))
    }

    async fn members_with_topics(
        &self,
    ) -> Result<HashMap<ClientId, HashSet<TopicName>>, StoreError> {
        Ok(Self::dump(&self.members))
    }
}
