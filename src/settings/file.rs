//! Settings stored as a JSON object in a local file.
//!
//! Backs the standalone binary, where the host environment tells us whether
//! this unit is the leader and each hook runs as a separate process.

use super::{SharedSettings, WriteOutcome};
use crate::error::{AppError, AppResult};
use crate::persist::{read_json_or_default, write_json_pretty};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    is_leader: bool,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>, is_leader: bool) -> Self {
        Self {
            path: path.into(),
            is_leader,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> AppResult<BTreeMap<String, String>> {
        read_json_or_default(&self.path)
            .map_err(|e| AppError::settings(format!("{}: {}", self.path.display(), e)))
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> AppResult<()> {
        write_json_pretty(&self.path, values)
            .map_err(|e| AppError::settings(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl SharedSettings for FileSettings {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        if !self.is_leader {
            return Err(AppError::not_leader(key));
        }
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> AppResult<WriteOutcome> {
        if !self.is_leader {
            return Err(AppError::not_leader(key));
        }
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all()?;
        if let Some(existing) = values.get(key) {
            return Ok(WriteOutcome::Existing(existing.clone()));
        }
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)?;
        Ok(WriteOutcome::Written)
    }

    async fn is_leader(&self) -> bool {
        self.is_leader
    }
}
