//! Background tasks: periodic release checks and delayed auto-confirm.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::{CheckOutcome, UpdateManager};
use crate::utils::{Result, UpdateError};

/// Delay before the first check when the last one is overdue
pub const INITIAL_CHECK_DELAY: Duration = Duration::from_secs(30);

/// Time to wait before the first scheduled check.
///
/// Resumes the interval from `last_check` so that a restart does not trigger
/// an immediate check, but never waits less than `initial_delay` once a
/// check is overdue.
pub fn first_delay(
    last_check: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
    initial_delay: Duration,
) -> Duration {
    let Some(last_check) = last_check else {
        return initial_delay;
    };

    let elapsed = (now - last_check).to_std().unwrap_or(Duration::ZERO);
    match interval.checked_sub(elapsed) {
        Some(remaining) if remaining > initial_delay => remaining,
        _ => initial_delay,
    }
}

/// Spawn the periodic check loop, or return `None` when auto-check is off.
pub fn start_auto_check(
    manager: Arc<UpdateManager>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let config = manager.config();
    if !config.enabled || !config.auto_check {
        info!("Automatic update checks disabled");
        return None;
    }
    let interval = config.auto_check_interval();

    Some(tokio::spawn(async move {
        let last_check = manager.snapshot().await.last_check;
        let delay = first_delay(last_check, Utc::now(), interval, INITIAL_CHECK_DELAY);
        info!("Automatic update check every {:?}, next in {:?}", interval, delay);

        check_loop(delay, interval, cancel, || {
            let manager = manager.clone();
            async move { manager.check_for_updates().await }
        })
        .await;

        info!("Update scheduler stopped");
    }))
}

/// Run `check` after `delay`, then once per `interval` until cancelled.
///
/// Every outcome, including a failed or skipped check, waits a full
/// interval before the next attempt.
async fn check_loop<F, Fut>(
    mut delay: Duration,
    interval: Duration,
    cancel: CancellationToken,
    mut check: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CheckOutcome>>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                match check().await {
                    Ok(outcome) if outcome.update_available => {
                        info!("Scheduled check found update {}", outcome.available_version);
                    }
                    Ok(_) => debug!("Scheduled check: up to date"),
                    Err(UpdateError::Busy) => {
                        debug!("Scheduled check skipped, another operation is running");
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("Scheduled update check failed, retrying next interval: {}", e);
                    }
                    Err(e) => error!("Scheduled update check failed: {}", e),
                }
                delay = interval;
            }
        }
    }
}

/// Confirm a pending verification after `after` of uptime.
///
/// Returns `None` when nothing is awaiting verification.
pub async fn start_auto_confirm(
    manager: Arc<UpdateManager>,
    after: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !manager.snapshot().await.pending_verification {
        return None;
    }
    info!("Update awaiting verification, auto-confirm in {:?}", after);

    Some(tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                if !manager.snapshot().await.pending_verification {
                    return;
                }
                match manager.confirm_update().await {
                    Ok(version) => info!("Auto-confirmed update {}", version),
                    Err(e) => warn!("Auto-confirm failed: {}", e),
                }
            }
        }
    }))
}
