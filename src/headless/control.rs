//! Session control from the headless command stream
//!
//! Commands read from stdin are applied to the running session through the
//! [`SessionControl`] trait, so the command handling can be driven without
//! real devices.

use std::path::PathBuf;

use livesync_app::{LiveSyncService, StopOptions};
use livesync_core::prelude::*;

use super::HeadlessEvent;

/// Commands accepted on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessCommand {
    ToggleWatcher,
    Quit,
}

/// Parse one stdin line; `None` for blank or unknown input
pub fn parse_command(line: &str) -> Option<HeadlessCommand> {
    match line.trim() {
        "t" | "toggle" => Some(HeadlessCommand::ToggleWatcher),
        "q" | "quit" => Some(HeadlessCommand::Quit),
        _ => None,
    }
}

/// Live-sync session operations available to the headless runner
#[trait_variant::make(SessionControl: Send)]
pub trait LocalSessionControl {
    /// Pause or resume file watching; returns whether watching is now paused
    async fn toggle_watchers(&self) -> bool;

    /// Detach every device and stop all watchers
    async fn stop(&self) -> Result<()>;

    fn device_identifiers(&self) -> Vec<String>;
}

/// [`SessionControl`] over a [`LiveSyncService`] project session
#[derive(Clone)]
pub struct LiveSyncControl {
    service: LiveSyncService,
    project_dir: PathBuf,
}

impl LiveSyncControl {
    pub fn new(service: LiveSyncService, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            project_dir: project_dir.into(),
        }
    }
}

impl SessionControl for LiveSyncControl {
    async fn toggle_watchers(&self) -> bool {
        self.service.toggle_file_watcher().await
    }

    async fn stop(&self) -> Result<()> {
        self.service
            .stop(
                &self.project_dir,
                None,
                StopOptions {
                    should_await_all_actions: true,
                },
            )
            .await
    }

    fn device_identifiers(&self) -> Vec<String> {
        self.service
            .device_descriptors(&self.project_dir)
            .into_iter()
            .map(|d| d.identifier)
            .collect()
    }
}

/// Apply a command; returns `true` when the runner should exit
pub async fn handle_command<C: SessionControl>(
    control: &C,
    command: HeadlessCommand,
) -> Result<bool> {
    match command {
        HeadlessCommand::ToggleWatcher => {
            let paused = control.toggle_watchers().await;
            info!("File watching {}", if paused { "paused" } else { "resumed" });
            HeadlessEvent::watcher_toggled(paused).emit();
            Ok(false)
        }
        HeadlessCommand::Quit => {
            info!(
                "Quit requested, detaching {} device(s)",
                control.device_identifiers().len()
            );
            control.stop().await?;
            Ok(true)
        }
    }
}
