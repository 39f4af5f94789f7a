//! Project toolchain for the command-line runner
//!
//! Concrete implementations of the collaborators the live-sync pipeline is
//! built on: `package.json` projects, a copying compiler, the Gradle-driven
//! Android native project, adb installs and script hooks.

pub mod compiler;
pub mod fs;
pub mod hooks;
pub mod installer;
pub mod native;
pub mod project;

pub use compiler::CopyCompiler;
pub use hooks::ScriptHooks;
pub use installer::AdbInstaller;
pub use native::AndroidNativePlatform;
pub use project::{ManifestProjectService, NodeModulesResolver, MANIFEST_FILE};
