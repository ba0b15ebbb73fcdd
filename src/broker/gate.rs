use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::persistence::ClientId;

/// Per-client mutual exclusion for membership transitions.
///
/// Opening, closing and evicting a client take its gate, so they never
/// interleave for one client while different clients proceed in parallel.
/// Idle gates are dropped on release.
#[derive(Debug, Default)]
pub struct ClientGates {
    gates: DashMap<ClientId, Arc<Mutex<()>>>,
}

impl ClientGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, client_id: &str) -> OwnedMutexGuard<()> {
        let gate = self
            .gates
            .entry(client_id.to_string())
            .or_default()
            .clone();
        gate.lock_owned().await
    }

    pub fn unlock(&self, client_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.gates
            .remove_if(client_id, |_, gate| Arc::strong_count(gate) == 1);
    }

    /// Number of clients with a gate held or awaited.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
