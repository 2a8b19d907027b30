//! File metadata handling for staging, apply and rollback.
//!
//! Every copy between `staging/`, `app/` and `backup/` keeps the source's
//! modification time and permission bits, so a rolled-back tree is
//! indistinguishable from the one that was backed up.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Metadata carried across copies
#[derive(Debug, Clone, Copy)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            permissions,
        })
    }

    /// Metadata as recorded in a tar header
    pub fn from_tar(size: u64, mode: u32, mtime: u64) -> Self {
        Self {
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime),
            permissions: Some(mode & 0o7777),
        }
    }

    /// Seconds since the Unix epoch (for manifests)
    pub fn mtime_secs(&self) -> i64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Apply permissions and modification time to a file
    pub async fn apply_to_path(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = self.permissions {
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
            }
        }

        let path = path.to_path_buf();
        let modified = self.modified;
        tokio::task::spawn_blocking(move || {
            // futimens only needs ownership, so read-only files work too
            std::fs::File::open(&path)?.set_modified(modified)
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Write `data` to `dest` through a temp sibling and rename it into place.
///
/// Renaming instead of truncating means a running executable is replaced
/// rather than rewritten (no ETXTBSY) and readers never see a torn file.
pub async fn write_atomic(dest: &Path, data: &[u8], metadata: &FileMetadata) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_sibling(dest);
    tokio::fs::write(&tmp, data).await?;
    metadata.apply_to_path(&tmp).await?;
    rename_into_place(&tmp, dest).await
}

/// Copy `src` to `dest` keeping mtime and permissions; returns bytes copied.
pub async fn copy_preserving(src: &Path, dest: &Path) -> io::Result<u64> {
    let metadata = FileMetadata::from_path(src).await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_sibling(dest);
    let copied = tokio::fs::copy(src, &tmp).await?;
    metadata.apply_to_path(&tmp).await?;
    rename_into_place(&tmp, dest).await?;

    Ok(copied)
}

/// Rename `tmp` over `dest`, removing `tmp` when that fails.
async fn rename_into_place(tmp: &Path, dest: &Path) -> io::Result<()> {
    if let Err(e) = tokio::fs::rename(tmp, dest).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(e);
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.update-tmp", name))
}
