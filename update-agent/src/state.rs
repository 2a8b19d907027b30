//! Durable update state.
//!
//! One JSON record per installation, read when the manager starts and
//! rewritten after every mutation. Fields missing from an older file take
//! their defaults so the schema can grow without migrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::utils::Result;

/// Update lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    #[default]
    Idle,
    Checking,
    Downloading,
    Staged,
    Applying,
    Verifying,
    /// Entered after repeated rollbacks; left only via `enable_updates`
    Disabled,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::Downloading => "downloading",
            UpdateState::Staged => "staged",
            UpdateState::Applying => "applying",
            UpdateState::Verifying => "verifying",
            UpdateState::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release metadata captured by the last successful check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub tag: String,
    pub download_url: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub current_version: String,
    pub available_version: Option<String>,
    pub staged_version: Option<String>,
    pub update_state: UpdateState,
    pub pending_verification: bool,
    pub consecutive_failures: u32,
    pub updates_disabled: bool,
    pub backup_version: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub release_info: Option<ReleaseInfo>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            current_version: "0.0.0".to_string(),
            available_version: None,
            staged_version: None,
            update_state: UpdateState::Idle,
            pending_verification: false,
            consecutive_failures: 0,
            updates_disabled: false,
            backup_version: None,
            last_check: None,
            last_update: None,
            release_info: None,
        }
    }
}

/// Reads and writes [`PersistedState`] at a fixed path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, falling back to defaults when the file is missing or
    /// unreadable. A corrupt file is logged, not fatal.
    pub async fn load(&self) -> PersistedState {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, using defaults", self.path.display());
                return PersistedState::default();
            }
            Err(e) => {
                warn!("Failed to read state file {}: {}", self.path.display(), e);
                return PersistedState::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Corrupt state file {}: {}, using defaults", self.path.display(), e);
                PersistedState::default()
            }
        }
    }

    /// Persist the state. Failures are logged and swallowed so that a
    /// read-only filesystem never takes the host process down.
    pub async fn save(&self, state: &PersistedState) {
        if let Err(e) = self.try_save(state).await {
            error!("Failed to persist update state to {}: {}", self.path.display(), e);
        }
    }

    /// Write to a sibling temp file and rename over the target.
    pub async fn try_save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
