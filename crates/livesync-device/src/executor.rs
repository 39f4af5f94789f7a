//! Concurrent per-device action runner
//!
//! [`DeviceExecutor::execute`] lists the known devices, starts the action for
//! every device that matches the predicate, and waits for all of them. A
//! failing device never cancels or delays the others; failures are collected
//! into an [`ExecutionReport`].

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;

use livesync_core::prelude::*;
use livesync_core::DeviceFailure;

use crate::devices::{Device, DeviceDiscovery};

/// Outcome of one device's action
#[derive(Debug)]
pub struct DeviceActionResult<T> {
    pub device: Device,
    pub result: Result<T>,
}

/// Per-device outcomes of one `execute` call, in device-list order
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub results: Vec<DeviceActionResult<T>>,
}

impl<T> ExecutionReport<T> {
    /// Split into successes and failures
    pub fn partition(self) -> (Vec<(Device, T)>, Vec<DeviceFailure>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for DeviceActionResult { device, result } in self.results {
            match result {
                Ok(value) => succeeded.push((device, value)),
                Err(error) => failed.push(DeviceFailure {
                    device_identifier: device.identifier,
                    error,
                }),
            }
        }
        (succeeded, failed)
    }

    /// Successful values, or a composite [`Error::DeviceActions`] when any
    /// device failed
    pub fn into_result(self) -> Result<Vec<(Device, T)>> {
        let (succeeded, failures) = self.partition();
        if failures.is_empty() {
            Ok(succeeded)
        } else {
            Err(Error::DeviceActions { failures })
        }
    }
}

/// Runs device actions across every device matching a predicate
#[derive(Clone)]
pub struct DeviceExecutor {
    discovery: Arc<dyn DeviceDiscovery>,
}

impl DeviceExecutor {
    pub fn new(discovery: Arc<dyn DeviceDiscovery>) -> Self {
        Self { discovery }
    }

    /// Run `action` concurrently on every device for which `predicate` holds.
    ///
    /// Only listing the devices can fail the call itself; per-device errors
    /// land in the report.
    pub async fn execute<T, F, Fut, P>(&self, action: F, predicate: P) -> Result<ExecutionReport<T>>
    where
        F: Fn(Device) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Device) -> bool,
    {
        let devices = self.discovery.devices().await?;
        let targets: Vec<Device> = devices.into_iter().filter(|d| predicate(d)).collect();

        debug!("Executing device action on {} device(s)", targets.len());

        let tasks = targets.into_iter().map(|device| {
            let action_future = action(device.clone());
            async move {
                let result = action_future.await;
                if let Err(ref e) = result {
                    debug!("Device action failed on {}: {}", device.identifier, e);
                }
                DeviceActionResult { device, result }
            }
        });

        let results = join_all(tasks).await;
        Ok(ExecutionReport { results })
    }
}
