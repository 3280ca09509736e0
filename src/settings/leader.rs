//! Settings kept by the host's leadership hook tools.
//!
//! `leader-get` answers on every unit, `leader-set` only on the unit that
//! `is-leader` currently reports as leader. The host replicates the values
//! and runs `leader-settings-changed` on the other units.

use super::SharedSettings;
use crate::error::{AppError, AppResult};
use crate::process;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

const LEADER_GET: &str = "leader-get";
const LEADER_SET: &str = "leader-set";
const IS_LEADER: &str = "is-leader";

/// Hook runs on one unit never overlap and only the leader may write, so the
/// default read-then-write `set_if_absent` is enough here.
#[derive(Debug, Default, Clone)]
pub struct LeaderToolSettings {
    tools_dir: Option<PathBuf>,
}

impl LeaderToolSettings {
    /// Tools resolved through `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tools resolved inside `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: Some(dir.into()),
        }
    }

    fn tool(&self, name: &str) -> String {
        match &self.tools_dir {
            Some(dir) => dir.join(name).to_string_lossy().into_owned(),
            None => name.to_string(),
        }
    }

    fn call(&self, name: &str, args: &[&str]) -> AppResult<String> {
        process::output(&self.tool(name), args)
            .map_err(|e| AppError::settings(format!("{name}: {e}")))
    }

    fn check_leader(&self) -> AppResult<bool> {
        let answer = self.call(IS_LEADER, &[])?;
        Ok(matches!(answer.trim(), "True" | "true"))
    }
}

#[async_trait]
impl SharedSettings for LeaderToolSettings {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let value = self.call(LEADER_GET, &[key])?;
        let value = value.strip_suffix('\n').unwrap_or(&value);
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        if !self.check_leader()? {
            return Err(AppError::not_leader(key));
        }
        let assignment = format!("{key}={value}");
        self.call(LEADER_SET, &[assignment.as_str()])?;
        debug!("Published leader setting '{}'", key);
        Ok(())
    }

    async fn is_leader(&self) -> bool {
        match self.check_leader() {
            Ok(leader) => leader,
            Err(e) => {
                warn!("Cannot determine leadership, assuming follower: {}", e);
                false
            }
        }
    }
}
