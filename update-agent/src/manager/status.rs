//! Values returned by manager operations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::host::MemoryInfo;
use crate::state::{ReleaseInfo, UpdateState};
use crate::version::VersionComparison;

/// Result of a successful release check
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub current_version: String,
    pub available_version: String,
    pub update_available: bool,
    pub version_comparison: VersionComparison,
    pub release_info: ReleaseInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub version: String,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub previous_version: String,
    pub version: String,
    pub updated: usize,
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub restored_version: String,
    pub consecutive_failures: u32,
    pub updates_disabled: bool,
}

/// Snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatus {
    pub enabled: bool,
    pub current_version: String,
    pub available_version: Option<String>,
    pub update_available: bool,
    pub version_comparison: VersionComparison,
    pub update_state: UpdateState,
    pub pending_verification: bool,
    pub consecutive_failures: u32,
    pub updates_disabled: bool,
    pub backup_version: Option<String>,
    pub staged_version: Option<String>,
    pub can_rollback: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub release_info: Option<ReleaseInfo>,
    pub platform: String,
    pub hostname: Option<String>,
    pub memory: MemoryInfo,
}
