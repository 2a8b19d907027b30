//! Host integration: process restart and live metrics.

use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{error, info, warn};

/// Restarts the host process after apply/rollback.
///
/// Fire-and-forget: on most targets the restart kills the calling process,
/// so implementations must not expect to observe the outcome and callers
/// must persist everything they need beforehand.
pub trait Restarter: Send + Sync {
    fn restart(&self, reason: &str);
}

/// `systemctl restart <service>`
pub struct SystemdRestarter {
    service: String,
}

impl SystemdRestarter {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Restarter for SystemdRestarter {
    fn restart(&self, reason: &str) {
        info!("Restarting service {} ({})", self.service, reason);
        let service = self.service.clone();

        tokio::spawn(async move {
            match tokio::process::Command::new("systemctl")
                .args(["restart", &service])
                .status()
                .await
            {
                Ok(status) if status.success() => {
                    info!("Service restart initiated");
                }
                Ok(status) => {
                    error!("systemctl restart exited with: {}", status);
                }
                Err(e) => {
                    error!("Failed to restart service: {}", e);
                }
            }
        });
    }
}

/// Exit the process and let the supervisor bring it back.
pub struct ExitRestarter {
    delay: Duration,
}

impl ExitRestarter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Restarter for ExitRestarter {
    fn restart(&self, reason: &str) {
        warn!("Exiting in {:?} for restart ({})", self.delay, reason);
        let delay = self.delay;

        // Delay so the HTTP response that triggered this can still go out
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            std::process::exit(0);
        });
    }
}

/// Pick the restart primitive for a configured service name.
pub fn restarter_for(service_name: Option<&str>) -> Arc<dyn Restarter> {
    match service_name.filter(|s| !s.is_empty()) {
        Some(service) => Arc::new(SystemdRestarter::new(service)),
        None => Arc::new(ExitRestarter::new(Duration::from_millis(500))),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    /// Resident memory of this process
    pub process_mb: Option<u64>,
}

/// Platform identifier, `raspi` on a Raspberry Pi, `<os>-<arch>` elsewhere.
///
/// Detected on first use and cached.
pub fn platform() -> &'static str {
    static PLATFORM: OnceLock<String> = OnceLock::new();
    PLATFORM.get_or_init(detect_platform)
}

fn detect_platform() -> String {
    let is_raspi = std::fs::read_to_string("/proc/device-tree/model")
        .map(|model| model.contains("Raspberry Pi"))
        .unwrap_or(false);

    if is_raspi {
        "raspi".to_string()
    } else {
        format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
    }
}

pub fn hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

/// Hostname and memory figures, read on the blocking pool.
pub async fn snapshot() -> (Option<String>, MemoryInfo) {
    tokio::task::spawn_blocking(|| (hostname(), memory()))
        .await
        .unwrap_or_else(|e| {
            warn!("Host metrics task failed: {}", e);
            (None, MemoryInfo::default())
        })
}

pub fn memory() -> MemoryInfo {
    const MB: u64 = 1024 * 1024;

    let mut sys = System::new();
    sys.refresh_memory();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_process(pid);
    let process_mb = sys.process(pid).map(|p| p.memory() / MB);

    MemoryInfo {
        total_mb: sys.total_memory() / MB,
        used_mb: sys.used_memory() / MB,
        free_mb: sys.available_memory() / MB,
        process_mb,
    }
}
