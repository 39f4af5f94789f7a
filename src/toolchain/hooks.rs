//! Project hook scripts
//!
//! A hook is an executable at `<project>/hooks/<stage>-<name>`, e.g.
//! `hooks/before-watchPatterns`. It receives the hook arguments as JSON on
//! stdin and may print replacement arguments as JSON on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use livesync_app::{HookArgs, HookRunner, HookStage};
use livesync_core::prelude::*;

pub const HOOKS_DIRECTORY: &str = "hooks";

#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptHooks;

impl ScriptHooks {
    pub fn hook_path(project_dir: &Path, stage: HookStage, name: &str) -> PathBuf {
        project_dir
            .join(HOOKS_DIRECTORY)
            .join(format!("{}-{}", stage.as_str(), name))
    }
}

#[async_trait]
impl HookRunner for ScriptHooks {
    async fn run(&self, stage: HookStage, name: &str, args: &mut HookArgs) -> Result<()> {
        let script = Self::hook_path(&args.project_dir, stage, name);
        if !script.is_file() {
            return Ok(());
        }
        let hook = format!("{}-{}", stage.as_str(), name);
        debug!("Running hook {}", script.display());

        let mut child = Command::new(&script)
            .current_dir(&args.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::hook(&hook, format!("failed to start: {}", e)))?;

        let input = serde_json::to_vec(args)?;
        if let Some(mut stdin) = child.stdin.take() {
            // A hook that never reads its input closes the pipe early
            if let Err(e) = stdin.write_all(&input).await {
                trace!("Hook {} did not read its arguments: {}", hook, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::hook(&hook, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::hook(
                &hook,
                format!("exited with code {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            match serde_json::from_str::<HookArgs>(stdout.trim()) {
                Ok(updated) => *args = updated,
                Err(e) => warn!("Ignoring output of hook {}: {}", hook, e),
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    use livesync_core::Platform;

    fn write_hook(project_dir: &Path, stage: HookStage, name: &str, body: &str) {
        let path = ScriptHooks::hook_path(project_dir, stage, name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_missing_hook_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut args = HookArgs::new(temp.path(), Some(Platform::Android));
        ScriptHooks
            .run(HookStage::Before, "prepare", &mut args)
            .await
            .unwrap();
        assert_eq!(args, HookArgs::new(temp.path(), Some(Platform::Android)));
    }

    #[tokio::test]
    async fn test_hook_output_replaces_args() {
        let temp = TempDir::new().unwrap();
        write_hook(
            temp.path(),
            HookStage::Before,
            "watchPatterns",
            &format!(
                "cat > /dev/null\necho '{{\"project_dir\":\"{}\",\"patterns\":[\"/extra/res\"]}}'",
                temp.path().display()
            ),
        );

        let mut args = HookArgs::new(temp.path(), None);
        ScriptHooks
            .run(HookStage::Before, "watchPatterns", &mut args)
            .await
            .unwrap();

        assert_eq!(args.patterns, vec![PathBuf::from("/extra/res")]);
    }

    #[tokio::test]
    async fn test_non_json_output_keeps_args() {
        let temp = TempDir::new().unwrap();
        write_hook(temp.path(), HookStage::After, "prepare", "echo prepared");

        let mut args = HookArgs::new(temp.path(), Some(Platform::Android));
        ScriptHooks
            .run(HookStage::After, "prepare", &mut args)
            .await
            .unwrap();
        assert_eq!(args.platform, Some(Platform::Android));
    }

    #[tokio::test]
    async fn test_failing_hook_is_an_error() {
        let temp = TempDir::new().unwrap();
        write_hook(temp.path(), HookStage::Before, "watch", "echo nope >&2; exit 2");

        let mut args = HookArgs::new(temp.path(), None);
        let err = ScriptHooks
            .run(HookStage::Before, "watch", &mut args)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Hook { ref hook, .. } if hook == "before-watch"));
        assert!(err.to_string().contains("nope"));
    }
}
