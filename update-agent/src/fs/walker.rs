//! Directory traversal for the live application tree.
//!
//! Paths are reported relative to the walk root using `/` separators, the
//! same form the archive extractor and the staging manifest use, so the
//! apply planner can compare them directly.

use std::path::Path;
use walkdir::WalkDir;

/// Walk a directory tree and collect the relative paths of all regular
/// files, sorted by name.
///
/// A missing root yields an empty list; a fresh install has no `app/` yet.
///
/// # Example
/// ```no_run
/// use update_agent::fs::walker::walk_directory;
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/opt/app/app")).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path) -> std::io::Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;

        // Directories and symlinks are never part of a release payload
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        files.push(to_slash(path.strip_prefix(root).unwrap_or(path)));
    }

    Ok(files)
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
