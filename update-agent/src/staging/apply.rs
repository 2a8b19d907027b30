//! Apply a staged release to the live tree, and undo it.
//!
//! The order is fixed: plan, back up, write, then mark the backup finished.
//! Nothing in `app/` is touched until the backup manifest is on disk, so an
//! apply that fails halfway can always be reverted with [`restore`]. A retry
//! after such a failure extends the unfinished backup instead of replacing
//! it, because the live tree no longer holds the original files.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::manifest::{read_manifest, write_manifest, BackupManifest, ManifestEntry, StagingManifest};
use super::remove_dir_if_exists;
use crate::fs::{copy_preserving, walk_directory, FileMetadata};
use crate::layout::{safe_join, InstallLayout};
use crate::utils::{Result, UpdateError};

/// What an apply will do to the live tree, as relative paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    /// Live files replaced by a staged file
    pub overwrite: Vec<String>,
    /// Staged files with no live counterpart
    pub add: Vec<String>,
    /// Live files absent from the release, inside an updateable directory
    pub delete: Vec<String>,
}

impl ApplyPlan {
    /// Files whose current content must be backed up
    pub fn to_backup(&self) -> impl Iterator<Item = &String> {
        self.overwrite.iter().chain(self.delete.iter())
    }
}

/// True when `path` lies strictly inside one of `dirs`
pub fn is_updateable(path: &str, dirs: &BTreeSet<String>) -> bool {
    dirs.iter()
        .map(|d| d.trim_matches('/'))
        .filter(|d| !d.is_empty())
        .any(|d| {
            path.strip_prefix(d)
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
        })
}

/// Compare the live tree with the staged release.
pub async fn plan(
    app_dir: &Path,
    staged: &StagingManifest,
    updateable_dirs: &BTreeSet<String>,
) -> Result<ApplyPlan> {
    let root = app_dir.to_path_buf();
    let live: BTreeSet<String> = tokio::task::spawn_blocking(move || walk_directory(&root))
        .await
        .map_err(|e| UpdateError::Archive(format!("scan task failed: {}", e)))??
        .into_iter()
        .collect();

    let mut plan = ApplyPlan::default();
    for path in staged.files.keys() {
        if live.contains(path) {
            plan.overwrite.push(path.clone());
        } else {
            plan.add.push(path.clone());
        }
    }

    for path in live.iter().filter(|p| !staged.files.contains_key(*p)) {
        if is_updateable(path, updateable_dirs) {
            plan.delete.push(path.clone());
        } else {
            debug!("Keeping {} (outside updateable directories)", path);
        }
    }

    Ok(plan)
}

/// The backup left by an apply of `version` that never completed.
pub async fn unfinished_backup(layout: &InstallLayout, version: &str) -> Option<BackupManifest> {
    match read_manifest::<BackupManifest>(&layout.backup_manifest()).await {
        Ok(Some(manifest)) if !manifest.finished && manifest.version == version => Some(manifest),
        Ok(_) => None,
        Err(e) => {
            warn!("Ignoring unreadable backup manifest: {}", e);
            None
        }
    }
}

/// Snapshot every file the plan will overwrite or delete into `backup/` and
/// record what the apply is going to add.
///
/// An unfinished backup of the same version is extended: paths it already
/// records keep their original content and stay in its added set.
pub async fn backup(layout: &InstallLayout, plan: &ApplyPlan, version: &str) -> Result<BackupManifest> {
    let mut manifest = match unfinished_backup(layout, version).await {
        Some(manifest) => {
            warn!("Resuming unfinished backup of version {}", version);
            manifest
        }
        None => {
            remove_dir_if_exists(&layout.backup_dir).await?;
            tokio::fs::create_dir_all(&layout.backup_dir).await?;
            BackupManifest {
                version: version.to_string(),
                created_at: Utc::now(),
                files: BTreeMap::new(),
                added: BTreeSet::new(),
                finished: false,
            }
        }
    };

    let mut total_bytes = 0u64;
    for path in plan.to_backup() {
        if manifest.files.contains_key(path) || manifest.added.contains(path) {
            continue;
        }

        let src = resolve(&layout.app_dir, path)?;
        let dest = resolve(&layout.backup_dir, path)?;

        total_bytes += copy_preserving(&src, &dest).await?;
        let meta = FileMetadata::from_path(&dest).await?;
        manifest.files.insert(
            path.clone(),
            ManifestEntry {
                size: meta.size,
                mtime: meta.mtime_secs(),
            },
        );
    }

    for path in &plan.add {
        if !manifest.files.contains_key(path) {
            manifest.added.insert(path.clone());
        }
    }
    write_manifest(&layout.backup_manifest(), &manifest).await?;

    info!(
        "Backed up {} files ({} bytes copied) of version {}",
        manifest.files.len(),
        total_bytes,
        version
    );
    Ok(manifest)
}

/// Record that the apply guarded by the backup wrote every file.
pub async fn finish_backup(layout: &InstallLayout, mut manifest: BackupManifest) -> Result<()> {
    manifest.finished = true;
    write_manifest(&layout.backup_manifest(), &manifest).await
}

/// Delete stale files, then copy the staged release into `app/`.
pub async fn apply(layout: &InstallLayout, plan: &ApplyPlan, staged: &StagingManifest) -> Result<()> {
    for path in &plan.delete {
        let target = resolve(&layout.app_dir, path)?;
        remove_file_if_exists(&target).await?;
        debug!("Deleted {}", path);
    }

    for path in staged.files.keys() {
        let src = resolve(&layout.staging_dir, path)?;
        let dest = resolve(&layout.app_dir, path)?;
        copy_preserving(&src, &dest).await?;
    }

    info!(
        "Applied {}: {} updated, {} added, {} deleted",
        staged.version,
        plan.overwrite.len(),
        plan.add.len(),
        plan.delete.len()
    );
    Ok(())
}

/// Put the backed-up files back and remove what the apply added.
///
/// The backup is left in place, so restoring twice is harmless.
pub async fn restore(layout: &InstallLayout) -> Result<BackupManifest> {
    let manifest: BackupManifest = read_manifest(&layout.backup_manifest())
        .await?
        .filter(|m: &BackupManifest| !m.is_empty())
        .ok_or_else(|| UpdateError::Precondition("no backup available to restore".to_string()))?;

    for path in manifest.files.keys() {
        let src = resolve(&layout.backup_dir, path)?;
        let dest = resolve(&layout.app_dir, path)?;
        copy_preserving(&src, &dest).await?;
    }

    for path in manifest.added.iter().filter(|p| !manifest.files.contains_key(*p)) {
        let target = resolve(&layout.app_dir, path)?;
        if let Err(e) = remove_file_if_exists(&target).await {
            warn!("Failed to remove {} during restore: {}", path, e);
        }
    }

    info!(
        "Restored version {} ({} files restored, {} removed)",
        manifest.version,
        manifest.files.len(),
        manifest.added.len()
    );
    Ok(manifest)
}

fn resolve(base: &Path, relative: &str) -> Result<PathBuf> {
    safe_join(base, relative)
        .ok_or_else(|| UpdateError::Archive(format!("refusing unsafe path: {}", relative)))
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
