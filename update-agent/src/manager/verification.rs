//! Post-apply verification window: confirm, roll back, re-enable.

use chrono::Utc;
use tracing::{error, info, warn};

use super::{RollbackOutcome, UpdateManager, FAILURE_THRESHOLD};
use crate::staging::{apply, remove_dir_if_exists};
use crate::state::UpdateState;
use crate::utils::{Result, UpdateError};

impl UpdateManager {
    /// Restore the pre-apply files and restart.
    ///
    /// Counts as a failed update. Reaching [`FAILURE_THRESHOLD`] switches
    /// updates off until [`UpdateManager::enable_updates`] is called.
    pub async fn rollback(&self) -> Result<RollbackOutcome> {
        let _op = self.begin()?;

        let backup_version = self
            .snapshot()
            .await
            .backup_version
            .ok_or_else(|| UpdateError::Precondition("no backup available to roll back to".to_string()))?;

        let manifest = apply::restore(&self.layout).await?;
        if manifest.version != backup_version {
            warn!(
                "Backup holds {} but state recorded {}",
                manifest.version, backup_version
            );
        }

        if let Err(e) = remove_dir_if_exists(&self.layout.staging_dir).await {
            warn!("Failed to clear staging after rollback: {}", e);
        }

        let outcome = self
            .mutate(|s| {
                s.current_version = backup_version.clone();
                s.pending_verification = false;
                s.staged_version = None;
                s.consecutive_failures += 1;

                if s.consecutive_failures >= FAILURE_THRESHOLD {
                    s.updates_disabled = true;
                    s.update_state = UpdateState::Disabled;
                } else {
                    s.update_state = UpdateState::Idle;
                }

                RollbackOutcome {
                    restored_version: s.current_version.clone(),
                    consecutive_failures: s.consecutive_failures,
                    updates_disabled: s.updates_disabled,
                }
            })
            .await;

        if outcome.updates_disabled {
            error!(
                "Rolled back to {}; updates disabled after {} consecutive failures",
                outcome.restored_version, outcome.consecutive_failures
            );
        } else {
            warn!(
                "Rolled back to {} (consecutive failures: {})",
                outcome.restored_version, outcome.consecutive_failures
            );
        }

        self.restarter
            .restart(&format!("rolled back to {}", outcome.restored_version));

        Ok(outcome)
    }

    /// Accept the running version; returns it.
    ///
    /// The backup is kept so a later manual rollback is still possible.
    pub async fn confirm_update(&self) -> Result<String> {
        let _op = self.begin()?;

        if !self.snapshot().await.pending_verification {
            return Err(UpdateError::Precondition(
                "no update is awaiting verification".to_string(),
            ));
        }

        let version = self
            .mutate(|s| {
                s.pending_verification = false;
                s.consecutive_failures = 0;
                s.update_state = UpdateState::Idle;
                s.last_update = Some(Utc::now());
                s.current_version.clone()
            })
            .await;

        if let Err(e) = remove_dir_if_exists(&self.layout.staging_dir).await {
            warn!("Failed to clear staging after confirm: {}", e);
        }

        info!("Update to {} confirmed", version);
        Ok(version)
    }

    /// Clear the failure counter and switch updates back on.
    pub async fn enable_updates(&self) {
        let was_disabled = self
            .mutate(|s| {
                let was_disabled = s.updates_disabled;
                s.updates_disabled = false;
                s.consecutive_failures = 0;
                if s.update_state == UpdateState::Disabled {
                    s.update_state = UpdateState::Idle;
                }
                was_disabled
            })
            .await;

        if was_disabled {
            info!("Updates re-enabled");
        }
    }
}
