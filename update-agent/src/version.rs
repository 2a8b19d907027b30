//! Version comparison for release discovery.
//!
//! Versions are compared numerically component by component. Anything after
//! the first `-` is ignored, and components that are not numbers count as 0,
//! so malformed input never fails and simply compares as "no update".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Relationship between the installed version and the published one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionComparison {
    UpdateAvailable,
    UpToDate,
    /// Local build is newer than the release (normal during development)
    LocalAhead,
    Unknown,
}

impl From<Ordering> for VersionComparison {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Greater => VersionComparison::UpdateAvailable,
            Ordering::Equal => VersionComparison::UpToDate,
            Ordering::Less => VersionComparison::LocalAhead,
        }
    }
}

/// Compare the local version against the remote one.
///
/// Returns `Greater` when `remote` is newer, `Less` when it is older and
/// `Equal` otherwise.
///
/// # Example
/// ```
/// use std::cmp::Ordering;
/// use update_agent::version::compare;
///
/// assert_eq!(compare("1.2.0", "1.3.0"), Ordering::Greater);
/// assert_eq!(compare("1.2.3-dev", "1.2.3"), Ordering::Equal);
/// ```
pub fn compare(local: &str, remote: &str) -> Ordering {
    let mut local = components(local);
    let mut remote = components(remote);

    let len = local.len().max(remote.len());
    local.resize(len, 0);
    remote.resize(len, 0);

    remote.cmp(&local)
}

/// Compare and classify in one step; a missing remote version is `Unknown`.
pub fn classify(local: &str, remote: Option<&str>) -> VersionComparison {
    match remote {
        Some(remote) => compare(local, remote).into(),
        None => VersionComparison::Unknown,
    }
}

/// Strip a leading `v` from a release tag (`v1.4.0` -> `1.4.0`).
pub fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    match tag.strip_prefix('v').or_else(|| tag.strip_prefix('V')) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => tag,
    }
}

fn components(version: &str) -> Vec<u64> {
    let core = version.trim().split('-').next().unwrap_or("");
    core.split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}
