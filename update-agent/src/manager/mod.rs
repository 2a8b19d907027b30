//! Update manager: the state machine behind check, download and apply.
//!
//! One manager owns one installation. Every operation reads the persisted
//! state, does its work, and writes the state back before returning. High
//! level operations are serialized by an operation gate; a second caller
//! gets [`UpdateError::Busy`] instead of queueing.

pub mod status;
mod verification;

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::host::{self, Restarter};
use crate::layout::InstallLayout;
use crate::release::ReleaseSource;
use crate::staging::{self, apply, manifest::StagingManifest};
use crate::state::{PersistedState, ReleaseInfo, StateStore, UpdateState};
use crate::transfer::HttpFetcher;
use crate::utils::{Result, UpdateError};
use crate::version::{self, classify};

pub use status::{ApplyOutcome, CheckOutcome, DownloadOutcome, RollbackOutcome, UpdateStatus};

/// Rollbacks in a row after which updates are switched off
pub const FAILURE_THRESHOLD: u32 = 2;

pub struct UpdateManager {
    config: UpdateConfig,
    layout: InstallLayout,
    store: StateStore,
    state: Mutex<PersistedState>,
    op_gate: Mutex<()>,
    source: ReleaseSource,
    fetcher: HttpFetcher,
    restarter: Arc<dyn Restarter>,
}

impl UpdateManager {
    /// Load the persisted state for `layout` and repair anything a crash
    /// may have left behind.
    pub async fn open(
        config: UpdateConfig,
        layout: InstallLayout,
        restarter: Arc<dyn Restarter>,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new()?;
        let source = ReleaseSource::new(config.source.clone(), fetcher.clone());
        let store = StateStore::new(layout.state_file.clone());

        // Detect the platform once, off the runtime threads
        let _ = tokio::task::spawn_blocking(host::platform).await;

        let mut state = store.load().await;
        recover(&mut state, &layout).await;
        store.save(&state).await;

        info!(
            "Update manager ready: version {}, state {}",
            state.current_version, state.update_state
        );

        Ok(Self {
            config,
            layout,
            store,
            state: Mutex::new(state),
            op_gate: Mutex::new(()),
            source,
            fetcher,
            restarter,
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Copy of the current persisted state
    pub async fn snapshot(&self) -> PersistedState {
        self.state.lock().await.clone()
    }

    /// Ask the release host for the newest version.
    ///
    /// Makes no network request when updates are disabled.
    pub async fn check_for_updates(&self) -> Result<CheckOutcome> {
        let _op = self.begin()?;
        self.ensure_enabled().await?;

        let prior = self
            .mutate(|s| {
                let prior = s.update_state;
                if prior == UpdateState::Idle {
                    s.update_state = UpdateState::Checking;
                }
                prior
            })
            .await;

        let result = self.source.latest(self.config.check_timeout()).await;

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                self.mutate(|s| {
                    if s.update_state == UpdateState::Checking {
                        s.update_state = prior;
                    }
                })
                .await;
                warn!("Update check failed: {}", e);
                return Err(e);
            }
        };

        let outcome = self
            .mutate(|s| {
                if s.update_state == UpdateState::Checking {
                    s.update_state = prior;
                }
                s.available_version = Some(remote.version.clone());
                s.release_info = Some(remote.info.clone());
                s.last_check = Some(Utc::now());

                let comparison = classify(&s.current_version, Some(&remote.version));
                CheckOutcome {
                    current_version: s.current_version.clone(),
                    available_version: remote.version.clone(),
                    update_available: version::compare(&s.current_version, &remote.version)
                        == Ordering::Greater,
                    version_comparison: comparison,
                    release_info: remote.info.clone(),
                }
            })
            .await;

        if outcome.update_available {
            info!(
                "Update available: {} -> {}",
                outcome.current_version, outcome.available_version
            );
        } else {
            debug!(
                "No update: installed {}, published {}",
                outcome.current_version, outcome.available_version
            );
        }

        Ok(outcome)
    }

    /// Fetch the release found by the last check and stage it.
    pub async fn download_update(&self) -> Result<DownloadOutcome> {
        let _op = self.begin()?;
        self.ensure_enabled().await?;

        let snapshot = self.snapshot().await;
        if !matches!(snapshot.update_state, UpdateState::Idle | UpdateState::Staged) {
            return Err(UpdateError::Precondition(format!(
                "cannot download while {}",
                snapshot.update_state
            )));
        }

        let version = snapshot.available_version.clone().ok_or_else(|| {
            UpdateError::Precondition("no update available, run a check first".to_string())
        })?;
        if version::compare(&snapshot.current_version, &version) != Ordering::Greater {
            return Err(UpdateError::Precondition(format!(
                "{} is not newer than installed {}",
                version, snapshot.current_version
            )));
        }
        let info = snapshot.release_info.clone().ok_or_else(|| {
            UpdateError::Precondition("no release information, run a check first".to_string())
        })?;

        self.mutate(|s| {
            s.update_state = UpdateState::Downloading;
            s.staged_version = None;
        })
        .await;

        info!("Downloading {} from {}", version, info.download_url);
        let result = self.fetch_and_stage(&version, &info).await;

        if let Err(e) = tokio::fs::remove_file(&self.layout.download_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.layout.download_file.display(), e);
            }
        }

        match result {
            Ok(manifest) => {
                self.mutate(|s| {
                    s.update_state = UpdateState::Staged;
                    s.staged_version = Some(version.clone());
                })
                .await;

                Ok(DownloadOutcome {
                    version,
                    files: manifest.files.len(),
                    bytes: manifest.total_bytes(),
                })
            }
            Err(e) => {
                self.mutate(|s| {
                    s.update_state = UpdateState::Idle;
                    s.staged_version = None;
                })
                .await;
                error!("Download of {} failed: {}", version, e);
                Err(e)
            }
        }
    }

    /// Back up the live tree and install the staged release, then restart.
    pub async fn apply_update(&self) -> Result<ApplyOutcome> {
        let _op = self.begin()?;

        let snapshot = self.snapshot().await;
        if snapshot.update_state != UpdateState::Staged {
            return Err(UpdateError::Precondition(format!(
                "no staged update to apply (state: {})",
                snapshot.update_state
            )));
        }
        let version = snapshot
            .staged_version
            .clone()
            .ok_or_else(|| UpdateError::Precondition("no staged version recorded".to_string()))?;

        let staged = match staging::load_staged(&self.layout).await {
            Ok(staged) if staged.version == version => staged,
            Ok(staged) => {
                self.discard_staging().await;
                return Err(UpdateError::Integrity(format!(
                    "staging holds {} but {} was expected",
                    staged.version, version
                )));
            }
            Err(e) => {
                self.discard_staging().await;
                return Err(e);
            }
        };

        let previous = snapshot.current_version.clone();
        self.mutate(|s| s.update_state = UpdateState::Applying).await;
        info!("Applying update {} -> {}", previous, version);

        let plan = match self.install(&staged, &previous).await {
            Ok(plan) => plan,
            Err(e) => {
                // The live tree may be half written. The backup stays
                // unfinished so a retry extends it and rollback still works.
                self.mutate(|s| s.update_state = UpdateState::Staged).await;
                error!("Apply of {} failed: {}", version, e);
                return Err(e);
            }
        };

        self.mutate(|s| {
            s.update_state = UpdateState::Verifying;
            s.pending_verification = true;
            s.current_version = version.clone();
            s.staged_version = None;
        })
        .await;

        self.restarter.restart(&format!("applied update {}", version));

        Ok(ApplyOutcome {
            previous_version: previous,
            version,
            updated: plan.overwrite.len(),
            added: plan.add.len(),
            deleted: plan.delete.len(),
        })
    }

    /// Current state plus host metrics.
    pub async fn status(&self) -> UpdateStatus {
        let state = self.snapshot().await;
        let can_rollback = state.backup_version.is_some()
            && tokio::fs::try_exists(self.layout.backup_manifest())
                .await
                .unwrap_or(false);

        let comparison = classify(&state.current_version, state.available_version.as_deref());
        let (hostname, memory) = host::snapshot().await;

        UpdateStatus {
            enabled: self.config.enabled,
            update_available: comparison == version::VersionComparison::UpdateAvailable,
            version_comparison: comparison,
            current_version: state.current_version,
            available_version: state.available_version,
            update_state: state.update_state,
            pending_verification: state.pending_verification,
            consecutive_failures: state.consecutive_failures,
            updates_disabled: state.updates_disabled,
            backup_version: state.backup_version,
            staged_version: state.staged_version,
            can_rollback,
            last_check: state.last_check,
            last_update: state.last_update,
            release_info: state.release_info,
            platform: host::platform().to_string(),
            hostname,
            memory,
        }
    }

    /// Restart the host service without changing any files.
    ///
    /// Refused with [`UpdateError::Busy`] while another operation runs.
    pub async fn restart_service(&self) -> Result<()> {
        let _op = self.begin()?;
        info!("Restart requested (version {})", self.snapshot().await.current_version);
        self.restarter.restart("restart requested");
        Ok(())
    }

    async fn fetch_and_stage(&self, version: &str, info: &ReleaseInfo) -> Result<StagingManifest> {
        staging::remove_dir_if_exists(&self.layout.staging_dir).await?;
        tokio::fs::create_dir_all(&self.layout.update_dir).await?;
        self.fetcher
            .download_to_file(
                &info.download_url,
                &self.source.headers(),
                &self.layout.download_file,
                self.config.download_timeout(),
            )
            .await?;

        staging::stage_archive(
            &self.layout,
            &self.layout.download_file,
            version,
            &self.config.required_files,
        )
        .await
    }

    async fn install(&self, staged: &StagingManifest, previous: &str) -> Result<apply::ApplyPlan> {
        let plan = apply::plan(&self.layout.app_dir, staged, &self.config.updateable_dirs).await?;

        // A fresh backup replaces the old one; an unfinished one is extended
        if apply::unfinished_backup(&self.layout, previous).await.is_none() {
            self.mutate(|s| s.backup_version = None).await;
        }
        let backup = apply::backup(&self.layout, &plan, previous).await?;
        self.mutate(|s| s.backup_version = Some(previous.to_string())).await;

        apply::apply(&self.layout, &plan, staged).await?;
        apply::finish_backup(&self.layout, backup).await?;
        Ok(plan)
    }

    async fn discard_staging(&self) {
        self.mutate(|s| {
            s.update_state = UpdateState::Idle;
            s.staged_version = None;
        })
        .await;
    }

    async fn ensure_enabled(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(UpdateError::Disabled(
                "updates are disabled in the configuration".to_string(),
            ));
        }

        let state = self.state.lock().await;
        if state.updates_disabled {
            return Err(UpdateError::Disabled(format!(
                "updates were switched off after {} consecutive failed updates",
                state.consecutive_failures
            )));
        }
        Ok(())
    }

    fn begin(&self) -> Result<MutexGuard<'_, ()>> {
        self.op_gate.try_lock().map_err(|_| UpdateError::Busy)
    }

    /// Apply `f` to the state and persist the result.
    async fn mutate<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        let mut state = self.state.lock().await;
        let result = f(&mut state);
        self.store.save(&state).await;
        result
    }
}

/// Bring a freshly loaded state back in line with the disk.
async fn recover(state: &mut PersistedState, layout: &InstallLayout) {
    // A half-applied tree may already carry the new VERSION file
    if apply::unfinished_backup(layout, &state.current_version).await.is_some() {
        warn!(
            "Apply over {} did not finish; keeping the recorded version",
            state.current_version
        );
    } else if let Ok(content) = tokio::fs::read_to_string(layout.version_file()).await {
        let installed = content.lines().next().unwrap_or("").trim();
        if !installed.is_empty() && installed != state.current_version {
            info!(
                "Installed version is {} (state said {})",
                installed, state.current_version
            );
            state.current_version = installed.to_string();
        }
    }

    let staged_ok = match &state.staged_version {
        Some(version) => staging::load_staged(layout)
            .await
            .map(|m| &m.version == version)
            .unwrap_or(false),
        None => false,
    };

    let recovered = match state.update_state {
        UpdateState::Checking => UpdateState::Idle,
        UpdateState::Downloading => UpdateState::Idle,
        UpdateState::Applying | UpdateState::Staged if staged_ok => UpdateState::Staged,
        UpdateState::Applying | UpdateState::Staged => UpdateState::Idle,
        UpdateState::Verifying if !state.pending_verification => UpdateState::Idle,
        UpdateState::Disabled if !state.updates_disabled => UpdateState::Idle,
        UpdateState::Idle if state.updates_disabled => UpdateState::Disabled,
        other => other,
    };

    if recovered != state.update_state {
        warn!(
            "Recovered from interrupted state {} -> {}",
            state.update_state, recovered
        );
        state.update_state = recovered;
    }
    if state.update_state != UpdateState::Staged {
        state.staged_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{install_app, release_archive, update_config, MockReleaseServer, RecordingRestarter};
    use tempfile::TempDir;

    const OLD_APP: &[(&str, &[u8])] = &[
        ("VERSION", b"1.0.0\n"),
        ("main.py", b"print('v1')"),
        ("static/old.js", b"// old"),
        ("data/user.db", b"precious"),
    ];

    const NEW_APP: &[(&str, &[u8])] = &[
        ("VERSION", b"1.1.0\n"),
        ("main.py", b"print('v2')"),
        ("static/new.js", b"// new"),
    ];

    async fn setup(
        files: &[(&str, &[u8])],
    ) -> (TempDir, MockReleaseServer, UpdateManager, Arc<RecordingRestarter>) {
        let temp_dir = TempDir::new().unwrap();
        let layout = install_app(temp_dir.path(), OLD_APP).await;
        let server = MockReleaseServer::start("v1.1.0", release_archive("1.1.0", files).await).await;
        let restarter = Arc::new(RecordingRestarter::default());
        let manager = UpdateManager::open(update_config(&server), layout, restarter.clone())
            .await
            .unwrap();
        (temp_dir, server, manager, restarter)
    }

    #[tokio::test]
    async fn test_open_reads_installed_version() {
        let (_temp_dir, _server, manager, _) = setup(NEW_APP).await;
        let state = manager.snapshot().await;
        assert_eq!(state.current_version, "1.0.0");
        assert_eq!(state.update_state, UpdateState::Idle);
        assert!(manager.layout().state_file.exists());
    }

    #[tokio::test]
    async fn test_check_download_apply() {
        let (_temp_dir, _server, manager, restarter) = setup(NEW_APP).await;

        let check = manager.check_for_updates().await.unwrap();
        assert!(check.update_available);
        assert_eq!(check.available_version, "1.1.0");
        assert_eq!(check.version_comparison, version::VersionComparison::UpdateAvailable);

        let download = manager.download_update().await.unwrap();
        assert_eq!(download.version, "1.1.0");
        assert_eq!(download.files, 3);
        let state = manager.snapshot().await;
        assert_eq!(state.update_state, UpdateState::Staged);
        assert_eq!(state.staged_version.as_deref(), Some("1.1.0"));
        assert!(!manager.layout().download_file.exists());

        let applied = manager.apply_update().await.unwrap();
        assert_eq!(applied.previous_version, "1.0.0");
        assert_eq!(applied.deleted, 1);

        let app = &manager.layout().app_dir;
        assert_eq!(tokio::fs::read(app.join("main.py")).await.unwrap(), b"print('v2')");
        assert!(app.join("static/new.js").exists());
        assert!(!app.join("static/old.js").exists());
        assert_eq!(tokio::fs::read(app.join("data/user.db")).await.unwrap(), b"precious");

        let state = manager.snapshot().await;
        assert_eq!(state.update_state, UpdateState::Verifying);
        assert!(state.pending_verification);
        assert_eq!(state.current_version, "1.1.0");
        assert_eq!(state.backup_version.as_deref(), Some("1.0.0"));
        assert_eq!(restarter.calls().len(), 1);

        let status = manager.status().await;
        assert!(status.can_rollback);
        assert!(!status.update_available);
    }

    #[tokio::test]
    async fn test_apply_requires_staged_release() {
        let (_temp_dir, _server, manager, restarter) = setup(NEW_APP).await;

        let err = manager.apply_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition(_)));

        manager.check_for_updates().await.unwrap();
        manager.download_update().await.unwrap();
        manager.apply_update().await.unwrap();

        // Already applied, nothing staged any more
        let err = manager.apply_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition(_)));
        assert_eq!(restarter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_download_requires_newer_version() {
        let (_temp_dir, _server, manager, _) = setup(NEW_APP).await;

        let err = manager.download_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition(_)));

        manager.check_for_updates().await.unwrap();
        manager.mutate(|s| s.current_version = "1.1.0".to_string()).await;
        let err = manager.download_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_missing_required_file_returns_to_idle() {
        let (_temp_dir, _server, manager, _) = setup(&[("main.py", b"print('v2')")]).await;

        manager.check_for_updates().await.unwrap();
        let err = manager.download_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Integrity(_)));

        let state = manager.snapshot().await;
        assert_eq!(state.update_state, UpdateState::Idle);
        assert!(state.staged_version.is_none());
        assert_eq!(state.consecutive_failures, 0);
        assert!(matches!(
            manager.apply_update().await.unwrap_err(),
            UpdateError::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_check_keeps_available_version() {
        let (_temp_dir, _server, manager, _) = setup(NEW_APP).await;
        manager.check_for_updates().await.unwrap();

        let mut config = manager.config().clone();
        config.source.api_base = "http://127.0.0.1:9".to_string();
        let layout = manager.layout().clone();
        drop(manager);

        let manager = UpdateManager::open(config, layout, Arc::new(RecordingRestarter::default()))
            .await
            .unwrap();
        let err = manager.check_for_updates().await.unwrap_err();
        assert!(err.is_recoverable());

        let state = manager.snapshot().await;
        assert_eq!(state.available_version.as_deref(), Some("1.1.0"));
        assert_eq!(state.update_state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_operation_is_busy() {
        let (_temp_dir, server, manager, _) = setup(NEW_APP).await;

        let _op = manager.begin().unwrap();
        let err = manager.check_for_updates().await.unwrap_err();
        assert!(matches!(err, UpdateError::Busy));
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn test_disabled_in_config_makes_no_request() {
        let temp_dir = TempDir::new().unwrap();
        let layout = install_app(temp_dir.path(), OLD_APP).await;
        let server = MockReleaseServer::start("v1.1.0", Vec::new()).await;
        let config = UpdateConfig {
            enabled: false,
            ..update_config(&server)
        };
        let manager = UpdateManager::open(config, layout, Arc::new(RecordingRestarter::default()))
            .await
            .unwrap();

        let err = manager.check_for_updates().await.unwrap_err();
        assert!(matches!(err, UpdateError::Disabled(_)));
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn test_recover_interrupted_states() {
        let temp_dir = TempDir::new().unwrap();
        let layout = install_app(temp_dir.path(), OLD_APP).await;

        let mut state = PersistedState {
            update_state: UpdateState::Downloading,
            staged_version: Some("1.1.0".to_string()),
            ..PersistedState::default()
        };
        recover(&mut state, &layout).await;
        assert_eq!(state.update_state, UpdateState::Idle);
        assert!(state.staged_version.is_none());
        assert_eq!(state.current_version, "1.0.0");

        // Applying without a usable staging area cannot resume
        state.update_state = UpdateState::Applying;
        state.staged_version = Some("1.1.0".to_string());
        recover(&mut state, &layout).await;
        assert_eq!(state.update_state, UpdateState::Idle);

        state.updates_disabled = true;
        state.consecutive_failures = FAILURE_THRESHOLD;
        recover(&mut state, &layout).await;
        assert_eq!(state.update_state, UpdateState::Disabled);
    }

    #[tokio::test]
    async fn test_retry_after_failed_apply_keeps_original_backup() {
        let (_temp_dir, _server, manager, restarter) = setup(&[
            ("VERSION", b"1.1.0\n"),
            ("main.py", b"print('v2')"),
            ("zz", b"file in the release"),
        ])
        .await;
        let app = manager.layout().app_dir.clone();
        tokio::fs::create_dir_all(app.join("zz")).await.unwrap();
        tokio::fs::write(app.join("zz/inner.txt"), b"in the way").await.unwrap();

        manager.check_for_updates().await.unwrap();
        manager.download_update().await.unwrap();

        // VERSION and main.py are written before `zz` fails
        assert!(manager.apply_update().await.is_err());
        assert_eq!(tokio::fs::read(app.join("main.py")).await.unwrap(), b"print('v2')");
        let state = manager.snapshot().await;
        assert_eq!(state.update_state, UpdateState::Staged);
        assert_eq!(state.current_version, "1.0.0");
        assert_eq!(state.backup_version.as_deref(), Some("1.0.0"));
        assert!(restarter.calls().is_empty());

        // A restart now must not pick up the half-written VERSION
        let config = manager.config().clone();
        let layout = manager.layout().clone();
        drop(manager);
        let manager = UpdateManager::open(config, layout, restarter.clone())
            .await
            .unwrap();
        let state = manager.snapshot().await;
        assert_eq!(state.current_version, "1.0.0");
        assert_eq!(state.update_state, UpdateState::Staged);

        tokio::fs::remove_dir_all(app.join("zz")).await.unwrap();
        manager.apply_update().await.unwrap();
        assert_eq!(tokio::fs::read(app.join("zz")).await.unwrap(), b"file in the release");

        let outcome = manager.rollback().await.unwrap();
        assert_eq!(outcome.restored_version, "1.0.0");
        assert_eq!(tokio::fs::read(app.join("main.py")).await.unwrap(), b"print('v1')");
        assert_eq!(tokio::fs::read(app.join("VERSION")).await.unwrap(), b"1.0.0\n");
        assert!(!app.join("zz").exists());
        assert_eq!(tokio::fs::read(app.join("data/user.db")).await.unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_failed_download_clears_previous_staging() {
        let (_temp_dir, server, manager, _) = setup(NEW_APP).await;
        manager.check_for_updates().await.unwrap();
        manager.download_update().await.unwrap();
        assert!(manager.layout().staging_manifest().exists());

        let missing = server.url("/files/missing.tar.gz");
        manager
            .mutate(|s| {
                if let Some(info) = s.release_info.as_mut() {
                    info.download_url = missing;
                }
            })
            .await;

        assert!(manager.download_update().await.is_err());
        assert!(!manager.layout().staging_dir.exists());
        assert!(staging::load_staged(manager.layout()).await.is_err());

        let state = manager.snapshot().await;
        assert_eq!(state.update_state, UpdateState::Idle);
        assert!(state.staged_version.is_none());
    }

    #[tokio::test]
    async fn test_restart_service() {
        let (_temp_dir, _server, manager, restarter) = setup(NEW_APP).await;

        {
            let _op = manager.begin().unwrap();
            assert!(matches!(manager.restart_service().await, Err(UpdateError::Busy)));
        }
        assert!(restarter.calls().is_empty());

        manager.restart_service().await.unwrap();
        assert_eq!(restarter.calls().len(), 1);
        assert_eq!(manager.snapshot().await.update_state, UpdateState::Idle);
    }
}
