//! Replicated settings shared by every node handle in one process.
//!
//! Used to run several nodes side by side (tests, embedded simulations).
//! Leadership is assigned explicitly with [`InMemoryCluster::elect`]; every
//! change is broadcast to all subscribers.

use super::{SharedSettings, WriteOutcome};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub type NodeId = u32;

const EVENT_CAPACITY: usize = 256;

/// Notification delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    SettingsChanged { key: String },
    LeaderChanged { leader: Option<NodeId> },
}

struct ClusterState {
    values: DashMap<String, String>,
    /// Held for reading across every write so leadership cannot move mid-write
    leader: RwLock<Option<NodeId>>,
    events: broadcast::Sender<ClusterEvent>,
    writes: AtomicUsize,
}

impl ClusterState {
    fn notify(&self, event: ClusterEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(ClusterState {
                values: DashMap::new(),
                leader: RwLock::new(None),
                events,
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Settings handle for one node.
    pub fn node(&self, id: NodeId) -> ClusterNode {
        ClusterNode {
            id,
            state: self.state.clone(),
        }
    }

    /// Make `id` the only leader.
    pub async fn elect(&self, id: NodeId) {
        self.set_leader(Some(id)).await;
    }

    /// Leave the cluster without a leader (e.g. during an election).
    pub async fn clear_leader(&self) {
        self.set_leader(None).await;
    }

    async fn set_leader(&self, leader: Option<NodeId>) {
        let mut guard = self.state.leader.write().await;
        if *guard == leader {
            return;
        }
        *guard = leader;
        drop(guard);
        debug!("Leadership moved to {:?}", leader);
        self.state.notify(ClusterEvent::LeaderChanged { leader });
    }

    pub async fn leader(&self) -> Option<NodeId> {
        *self.state.leader.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.state.events.subscribe()
    }

    /// Current value of `key`, bypassing any node handle.
    pub fn value(&self, key: &str) -> Option<String> {
        self.state.values.get(key).map(|v| v.value().clone())
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("keys", &self.state.values.len())
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

/// One node's view of an [`InMemoryCluster`].
#[derive(Clone)]
pub struct ClusterNode {
    id: NodeId,
    state: Arc<ClusterState>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode").field("id", &self.id).finish()
    }
}

#[async_trait]
impl SharedSettings for ClusterNode {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.state.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let leader = self.state.leader.read().await;
        if *leader != Some(self.id) {
            return Err(AppError::not_leader(key));
        }
        self.state.values.insert(key.to_string(), value.to_string());
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        drop(leader);

        self.state.notify(ClusterEvent::SettingsChanged {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> AppResult<WriteOutcome> {
        let leader = self.state.leader.read().await;
        if *leader != Some(self.id) {
            return Err(AppError::not_leader(key));
        }
        let outcome = match self.state.values.entry(key.to_string()) {
            Entry::Occupied(existing) => WriteOutcome::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                WriteOutcome::Written
            }
        };
        drop(leader);

        if outcome == WriteOutcome::Written {
            self.state.writes.fetch_add(1, Ordering::SeqCst);
            self.state.notify(ClusterEvent::SettingsChanged {
                key: key.to_string(),
            });
        }
        Ok(outcome)
    }

    async fn is_leader(&self) -> bool {
        *self.state.leader.read().await == Some(self.id)
    }
}
