//! Directory layout of an installation.
//!
//! ```text
//! <install>/
//!   app/                  live application files
//!   .update/
//!     state.json          persisted update state
//!     staging/            extracted candidate release
//!     backup/             pre-apply snapshot, one generation
//!     download.tar.gz     archive being downloaded
//! ```
//!
//! `.update/` sits next to `app/` so that it survives apply and rollback.

use std::path::{Component, Path, PathBuf};

/// Name of the manifest file written into `staging/` and `backup/`
pub const MANIFEST_FILE: &str = ".manifest.json";

#[derive(Debug, Clone)]
pub struct InstallLayout {
    pub root: PathBuf,
    pub app_dir: PathBuf,
    pub update_dir: PathBuf,
    pub state_file: PathBuf,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub download_file: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let update_dir = root.join(".update");
        Self {
            app_dir: root.join("app"),
            state_file: update_dir.join("state.json"),
            staging_dir: update_dir.join("staging"),
            backup_dir: update_dir.join("backup"),
            download_file: update_dir.join("download.tar.gz"),
            update_dir,
            root,
        }
    }

    pub fn version_file(&self) -> PathBuf {
        self.app_dir.join("VERSION")
    }

    pub fn staging_manifest(&self) -> PathBuf {
        self.staging_dir.join(MANIFEST_FILE)
    }

    pub fn backup_manifest(&self) -> PathBuf {
        self.backup_dir.join(MANIFEST_FILE)
    }
}

/// Resolve a slash-separated relative path under `base`, rejecting anything
/// that would escape it (absolute paths, `..`).
pub fn safe_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() {
        return None;
    }

    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}
