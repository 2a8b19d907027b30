//! Manifests for the staging and backup areas.
//!
//! Each area carries a `.manifest.json` recording exactly which files it
//! holds, so apply and rollback never have to infer intent from whatever
//! happens to be on disk.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::utils::Result;

/// Metadata for a single file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime: i64,
}

/// Extracted candidate release, written as `staging/.manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingManifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// False when the release failed the required-file check
    pub valid: bool,
    #[serde(default)]
    pub missing: Vec<String>,
    pub files: BTreeMap<String, ManifestEntry>,
}

impl StagingManifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }
}

/// Pre-apply snapshot, written as `backup/.manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Version that was live when the snapshot was taken
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// Files copied into the backup (overwritten or deleted by apply)
    pub files: BTreeMap<String, ManifestEntry>,
    /// Files the apply created that did not exist before
    #[serde(default)]
    pub added: BTreeSet<String>,
    /// False until the apply this backup guards has written every file
    #[serde(default = "default_finished")]
    pub finished: bool,
}

fn default_finished() -> bool {
    true
}

impl BackupManifest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.added.is_empty()
    }
}

pub async fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_manifest<T: Serialize>(path: &Path, manifest: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(manifest)?).await?;
    Ok(())
}
