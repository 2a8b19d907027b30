//! Staging area for a downloaded release.
//!
//! A release is extracted into `.update/staging/` together with a manifest.
//! Only a manifest marked valid (all required files present) can be applied;
//! a rejected download leaves its files in place for inspection but the
//! manifest records it as invalid.

pub mod apply;
pub mod manifest;

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

use crate::archive;
use crate::layout::InstallLayout;
use crate::utils::{Result, UpdateError};
use manifest::{read_manifest, write_manifest, ManifestEntry, StagingManifest};

/// Remove a directory tree; a missing directory is not an error.
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Replace the staging area with the contents of `archive`.
///
/// Fails with [`UpdateError::Integrity`] when a required file is absent; the
/// manifest is still written, flagged invalid.
pub async fn stage_archive(
    layout: &InstallLayout,
    archive: &Path,
    version: &str,
    required_files: &BTreeSet<String>,
) -> Result<StagingManifest> {
    remove_dir_if_exists(&layout.staging_dir).await?;

    let extracted = archive::extract_to_dir(archive, &layout.staging_dir).await?;
    let files: BTreeMap<String, ManifestEntry> = extracted
        .into_iter()
        .map(|f| (f.path, ManifestEntry { size: f.size, mtime: f.mtime }))
        .collect();

    let missing: Vec<String> = required_files
        .iter()
        .map(|r| r.trim_start_matches('/'))
        .filter(|r| !files.contains_key(*r))
        .map(str::to_string)
        .collect();

    let manifest = StagingManifest {
        version: version.to_string(),
        created_at: Utc::now(),
        valid: missing.is_empty(),
        missing: missing.clone(),
        files,
    };
    write_manifest(&layout.staging_manifest(), &manifest).await?;

    if !missing.is_empty() {
        warn!(
            "Release {} rejected, missing required files: {}",
            version,
            missing.join(", ")
        );
        return Err(UpdateError::Integrity(format!(
            "release {} is missing required files: {}",
            version,
            missing.join(", ")
        )));
    }

    info!(
        "Staged release {} ({} files, {} bytes)",
        version,
        manifest.files.len(),
        manifest.total_bytes()
    );
    Ok(manifest)
}

/// Load the staged release, refusing an invalid or empty one.
pub async fn load_staged(layout: &InstallLayout) -> Result<StagingManifest> {
    let manifest: StagingManifest = read_manifest(&layout.staging_manifest())
        .await?
        .ok_or_else(|| UpdateError::Precondition("no staged release found".to_string()))?;

    if !manifest.valid {
        return Err(UpdateError::Integrity(format!(
            "staged release {} failed validation (missing: {})",
            manifest.version,
            manifest.missing.join(", ")
        )));
    }
    if manifest.files.is_empty() {
        return Err(UpdateError::Precondition(format!(
            "staged release {} contains no files",
            manifest.version
        )));
    }

    Ok(manifest)
}
