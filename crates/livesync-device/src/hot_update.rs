//! Hot update status tracking from device logs
//!
//! The runtime prints one line per hot update it processed:
//!
//! ```text
//! Successfully applied update with hmr hash 1a2b3c
//! Cannot apply update with hmr hash 1a2b3c
//! ```
//!
//! [`HotUpdateMonitor`] collects those per device so the orchestrator can
//! wait for the verdict of a specific hash.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::sync::broadcast;

use livesync_core::prelude::*;

static HOT_UPDATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Successfully applied update|Cannot apply update) with hmr hash ([0-9A-Za-z]+)")
        .expect("Invalid hot update regex")
});

const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotUpdateStatus {
    Success,
    Failed,
}

/// Extract `(status, hash)` from a device log line
pub fn parse_hot_update_line(line: &str) -> Option<(HotUpdateStatus, String)> {
    let captures = HOT_UPDATE_PATTERN.captures(line)?;
    let status = if captures[1].starts_with("Successfully") {
        HotUpdateStatus::Success
    } else {
        HotUpdateStatus::Failed
    };
    Some((status, captures[2].to_string()))
}

#[derive(Debug, Clone)]
struct StatusUpdate {
    device_identifier: String,
    hash: String,
    status: HotUpdateStatus,
}

pub struct HotUpdateMonitor {
    statuses: Mutex<HashMap<(String, String), HotUpdateStatus>>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl Default for HotUpdateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HotUpdateMonitor {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            statuses: Mutex::new(HashMap::new()),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), HotUpdateStatus>> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one device log line; returns the status it carried, if any
    pub fn process_log_line(&self, device_identifier: &str, line: &str) -> Option<HotUpdateStatus> {
        let (status, hash) = parse_hot_update_line(line)?;
        self.record(device_identifier, &hash, status);
        Some(status)
    }

    pub fn record(&self, device_identifier: &str, hash: &str, status: HotUpdateStatus) {
        debug!(
            "Hot update {} on {}: {:?}",
            hash, device_identifier, status
        );
        self.lock()
            .insert((device_identifier.to_string(), hash.to_string()), status);
        let _ = self.updates.send(StatusUpdate {
            device_identifier: device_identifier.to_string(),
            hash: hash.to_string(),
            status,
        });
    }

    pub fn status(&self, device_identifier: &str, hash: &str) -> Option<HotUpdateStatus> {
        self.lock()
            .get(&(device_identifier.to_string(), hash.to_string()))
            .copied()
    }

    /// Wait for the status of `hash` on a device; `None` when nothing was
    /// reported within `timeout`
    pub async fn await_status(
        &self,
        device_identifier: &str,
        hash: &str,
        timeout: Duration,
    ) -> Option<HotUpdateStatus> {
        let mut updates = self.updates.subscribe();
        if let Some(status) = self.status(device_identifier, hash) {
            return Some(status);
        }

        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(update)
                        if update.device_identifier == device_identifier && update.hash == hash =>
                    {
                        return Some(update.status);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(status) = self.status(device_identifier, hash) {
                            return Some(status);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Forget everything recorded for a device
    pub fn forget_device(&self, device_identifier: &str) {
        self.lock().retain(|(device, _), _| device != device_identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse_hot_update_line() {
        assert_eq!(
            parse_hot_update_line("JS: HMR: Successfully applied update with hmr hash 9f3c2a"),
            Some((HotUpdateStatus::Success, "9f3c2a".to_string()))
        );
        assert_eq!(
            parse_hot_update_line("Cannot apply update with hmr hash abc123"),
            Some((HotUpdateStatus::Failed, "abc123".to_string()))
        );
        assert_eq!(parse_hot_update_line("JS: console.log"), None);
    }

    #[tokio::test]
    async fn test_await_status_already_reported() {
        let monitor = HotUpdateMonitor::new();
        monitor.process_log_line("emu", "Cannot apply update with hmr hash h1");

        let status = monitor
            .await_status("emu", "h1", Duration::from_millis(10))
            .await;
        assert_eq!(status, Some(HotUpdateStatus::Failed));
    }

    #[tokio::test]
    async fn test_await_status_reported_later() {
        let monitor = Arc::new(HotUpdateMonitor::new());
        let reporter = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reporter.process_log_line("other", "Cannot apply update with hmr hash h1");
            reporter.process_log_line("emu", "Successfully applied update with hmr hash h1");
        });

        let status = monitor
            .await_status("emu", "h1", Duration::from_secs(5))
            .await;
        assert_eq!(status, Some(HotUpdateStatus::Success));
    }

    #[tokio::test]
    async fn test_await_status_times_out() {
        let monitor = HotUpdateMonitor::new();
        let status = monitor
            .await_status("emu", "never", Duration::from_millis(20))
            .await;
        assert_eq!(status, None);
    }

    #[test]
    fn test_forget_device() {
        let monitor = HotUpdateMonitor::new();
        monitor.record("emu", "h1", HotUpdateStatus::Success);
        monitor.record("other", "h1", HotUpdateStatus::Success);
        monitor.forget_device("emu");
        assert_eq!(monitor.status("emu", "h1"), None);
        assert_eq!(monitor.status("other", "h1"), Some(HotUpdateStatus::Success));
    }
}
