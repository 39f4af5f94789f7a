//! Connected devices and the discovery collaborator seam

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use livesync_core::prelude::*;
use livesync_core::Platform;

/// Connection status reported by the platform tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Connected,
    Unauthorized,
    Offline,
}

/// A device or emulator known to the discovery service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    /// Unique device identifier (adb serial, simulator UDID)
    pub identifier: String,

    /// Human-readable device name
    pub name: String,

    pub platform: Platform,

    /// Whether this is an emulator/simulator
    #[serde(default)]
    pub is_emulator: bool,

    pub status: DeviceStatus,
}

impl Device {
    /// Get a display string for the device
    pub fn display_name(&self) -> String {
        if self.is_emulator {
            format!("{} ({} emulator)", self.name, self.platform)
        } else {
            self.name.clone()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == DeviceStatus::Connected
    }

    /// Check if device matches a device specifier
    ///
    /// The specifier can be:
    /// - Exact device identifier
    /// - Device name (case-insensitive partial match)
    /// - Platform name (e.g., "ios", "android")
    pub fn matches(&self, specifier: &str) -> bool {
        let spec_lower = specifier.to_lowercase();

        if self.identifier.to_lowercase() == spec_lower {
            return true;
        }

        if self.name.to_lowercase().contains(&spec_lower) {
            return true;
        }

        self.platform.as_str() == spec_lower
    }
}

/// Device attach/detach notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Found(Device),
    Lost(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            DeviceEvent::Found(device) | DeviceEvent::Lost(device) => device,
        }
    }
}

/// Source of the currently known devices
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Snapshot of the currently known devices
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Receive `Found`/`Lost` notifications from now on
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Find a device matching the given specifier
pub fn find_device<'a>(devices: &'a [Device], specifier: &str) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.identifier == specifier)
        .or_else(|| devices.iter().find(|d| d.matches(specifier)))
}

/// Filter devices by platform
pub fn filter_by_platform(devices: &[Device], platform: Platform) -> Vec<&Device> {
    devices.iter().filter(|d| d.platform == platform).collect()
}

/// Compute the events that turn `previous` into `current`
///
/// A device whose status changed away from `Connected` counts as lost; one
/// that became `Connected` counts as found.
pub fn diff_devices(previous: &[Device], current: &[Device]) -> Vec<DeviceEvent> {
    let before: HashMap<&str, &Device> = previous
        .iter()
        .filter(|d| d.is_connected())
        .map(|d| (d.identifier.as_str(), d))
        .collect();
    let after: HashMap<&str, &Device> = current
        .iter()
        .filter(|d| d.is_connected())
        .map(|d| (d.identifier.as_str(), d))
        .collect();

    let mut events = Vec::new();
    for device in previous.iter().filter(|d| d.is_connected()) {
        if !after.contains_key(device.identifier.as_str()) {
            events.push(DeviceEvent::Lost(device.clone()));
        }
    }
    for device in current.iter().filter(|d| d.is_connected()) {
        if !before.contains_key(device.identifier.as_str()) {
            events.push(DeviceEvent::Found(device.clone()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(id: &str, name: &str, platform: Platform, status: DeviceStatus) -> Device {
        Device {
            identifier: id.to_string(),
            name: name.to_string(),
            platform,
            is_emulator: id.starts_with("emulator-"),
            status,
        }
    }

    #[test]
    fn test_device_matches() {
        let device = sample_device(
            "emulator-5554",
            "Pixel 8 API 34",
            Platform::Android,
            DeviceStatus::Connected,
        );

        assert!(device.matches("emulator-5554"));
        assert!(device.matches("pixel"));
        assert!(device.matches("android"));
        assert!(!device.matches("ios"));
    }

    #[test]
    fn test_find_device_prefers_exact_identifier() {
        let devices = vec![
            sample_device("A1", "Phone A12", Platform::Android, DeviceStatus::Connected),
            sample_device("A12", "Phone", Platform::Android, DeviceStatus::Connected),
        ];

        assert_eq!(find_device(&devices, "A12").unwrap().identifier, "A12");
        assert!(find_device(&devices, "missing").is_none());
    }

    #[test]
    fn test_filter_by_platform() {
        let devices = vec![
            sample_device("a", "Android", Platform::Android, DeviceStatus::Connected),
            sample_device("i", "iPhone", Platform::Ios, DeviceStatus::Connected),
        ];
        let android = filter_by_platform(&devices, Platform::Android);
        assert_eq!(android.len(), 1);
        assert_eq!(android[0].identifier, "a");
    }

    #[test]
    fn test_diff_devices_reports_found_and_lost() {
        let previous = vec![
            sample_device("a", "A", Platform::Android, DeviceStatus::Connected),
            sample_device("b", "B", Platform::Android, DeviceStatus::Connected),
        ];
        let current = vec![
            sample_device("b", "B", Platform::Android, DeviceStatus::Offline),
            sample_device("c", "C", Platform::Android, DeviceStatus::Connected),
        ];

        let events = diff_devices(&previous, &current);
        let lost: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Lost(d) => Some(d.identifier.as_str()),
                _ => None,
            })
            .collect();
        let found: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Found(d) => Some(d.identifier.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(lost, vec!["a", "b"]);
        assert_eq!(found, vec!["c"]);
    }

    #[test]
    fn test_diff_devices_no_change() {
        let devices = vec![sample_device(
            "a",
            "A",
            Platform::Android,
            DeviceStatus::Connected,
        )];
        assert!(diff_devices(&devices, &devices).is_empty());
    }
}
