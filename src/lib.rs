//! livesync library
//!
//! Command-line side of livesync: the concrete project toolchain and the
//! headless runner that drives the orchestrator from `livesync-app`.

pub mod headless;
pub mod toolchain;

pub use headless::runner::{run_headless, RunOptions};
