//! livesync - watch, rebuild and live-sync apps onto connected devices
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use livesync::RunOptions;

/// Watch a project and live-sync it onto connected devices
#[derive(Parser, Debug)]
#[command(name = "livesync")]
#[command(about = "Watch, rebuild and live-sync apps onto connected devices", long_about = None)]
struct Args {
    /// Path to the project (defaults to the current directory)
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Device identifier or name to sync to (repeatable; default: all connected)
    #[arg(long = "device", value_name = "ID")]
    devices: Vec<String>,

    /// Sync once and exit
    #[arg(long)]
    no_watch: bool,

    /// Do not watch native sources
    #[arg(long)]
    no_native_watch: bool,

    /// Disable hot module replacement
    #[arg(long)]
    no_hmr: bool,

    /// Start the app waiting for a debugger; every change restarts it
    #[arg(long)]
    debug_brk: bool,

    /// Rebuild the native app even when a package exists
    #[arg(long)]
    clean: bool,
}

impl Args {
    fn into_options(self, project_dir: PathBuf) -> RunOptions {
        RunOptions {
            project_dir,
            devices: self.devices,
            watch: !self.no_watch,
            watch_native: !self.no_native_watch,
            hot_updates: !self.no_hmr,
            debug_brk: self.debug_brk,
            clean: self.clean,
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    livesync_core::logging::init()?;

    let args = Args::parse();

    let base_path = match &args.path {
        Some(path) => path.clone(),
        None => std::env::current_dir().wrap_err("Cannot determine the current directory")?,
    };
    let project_dir = dunce::canonicalize(&base_path)
        .wrap_err_with(|| format!("Project directory {} not found", base_path.display()))?;

    livesync::run_headless(args.into_options(project_dir)).await?;
    Ok(())
}
