//! Leader-writable, everyone-readable key/value settings.
//!
//! Leadership itself is decided elsewhere; implementations only report
//! whether this node currently holds it and refuse writes when it does not.

pub mod file;
pub mod leader;
pub mod memory;

pub use file::FileSettings;
pub use leader::LeaderToolSettings;
pub use memory::{ClusterEvent, ClusterNode, InMemoryCluster, NodeId};

use crate::error::AppResult;
use async_trait::async_trait;

/// Result of a first-writer-wins write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Our value is now stored
    Written,
    /// Someone else's value was already there and was kept
    Existing(String),
}

#[async_trait]
pub trait SharedSettings: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Fails with `AppError::NotLeader` unless this node is the leader.
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// Store `value` only if `key` has no value yet.
    ///
    /// Backends that can check and write under one lock should override
    /// this; the default is a plain read followed by a write.
    async fn set_if_absent(&self, key: &str, value: &str) -> AppResult<WriteOutcome> {
        if let Some(existing) = self.get(key).await? {
            return Ok(WriteOutcome::Existing(existing));
        }
        self.set(key, value).await?;
        Ok(WriteOutcome::Written)
    }

    async fn is_leader(&self) -> bool;
}
