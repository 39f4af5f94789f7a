//! Project lifecycle hooks
//!
//! Hooks run before and after named stages (`prepare`, `watch`) and may rewrite
//! their arguments, which is how `watchPatterns` hooks extend the native
//! watcher's pattern list.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use livesync_core::prelude::*;
use livesync_core::Platform;

pub const PREPARE_HOOK: &str = "prepare";
pub const WATCH_HOOK: &str = "watch";
pub const WATCH_PATTERNS_HOOK: &str = "watchPatterns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStage {
    Before,
    After,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::Before => "before",
            HookStage::After => "after",
        }
    }
}

/// Arguments handed to a hook; hooks may modify them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookArgs {
    pub project_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<PathBuf>,
}

impl HookArgs {
    pub fn new(project_dir: impl Into<PathBuf>, platform: Option<Platform>) -> Self {
        Self {
            project_dir: project_dir.into(),
            platform,
            patterns: Vec::new(),
        }
    }
}

#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, stage: HookStage, name: &str, args: &mut HookArgs) -> Result<()>;
}

/// Runs nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl HookRunner for NoopHooks {
    async fn run(&self, _stage: HookStage, _name: &str, _args: &mut HookArgs) -> Result<()> {
        Ok(())
    }
}

/// Wrap `action` in the before/after hooks of `name`.
///
/// The after hook only runs when the action succeeded.
pub async fn with_hooks<T, F, Fut>(
    hooks: &dyn HookRunner,
    name: &str,
    mut args: HookArgs,
    action: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    hooks.run(HookStage::Before, name, &mut args).await?;
    let value = action().await?;
    hooks.run(HookStage::After, name, &mut args).await?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HookRunner for RecordingHooks {
        async fn run(&self, stage: HookStage, name: &str, _args: &mut HookArgs) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}-{}", stage.as_str(), name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_with_hooks_order() {
        let hooks = RecordingHooks::default();
        let value = with_hooks(&hooks, PREPARE_HOOK, HookArgs::default(), || async {
            hooks.calls.lock().unwrap().push("action".into());
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            *hooks.calls.lock().unwrap(),
            vec!["before-prepare", "action", "after-prepare"]
        );
    }

    #[tokio::test]
    async fn test_with_hooks_skips_after_on_error() {
        let hooks = RecordingHooks::default();
        let result: Result<()> = with_hooks(&hooks, WATCH_HOOK, HookArgs::default(), || async {
            Err(Error::compiler("bundle failed"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*hooks.calls.lock().unwrap(), vec!["before-watch"]);
    }

    #[test]
    fn test_hook_args_serialization() {
        let args = HookArgs::new("/work/app", Some(Platform::Android));
        let json = serde_json::to_string(&args).unwrap();
        assert!(json.contains(r#""platform":"android""#));
        assert!(!json.contains("patterns"));
    }
}
