//! # livesync-core - Core Domain Types
//!
//! Foundation crate for livesync. Provides domain types, error handling,
//! event definitions and logging setup.
//!
//! This crate has **zero internal dependencies**.
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Platform`] - Target platform (Android, iOS)
//! - [`ChangeDescriptor`] - What changed in a project, with merge semantics
//! - [`HotUpdate`] - Hot update token and fallback files
//! - [`PrepareResult`] - Outcome of a prepare pass
//!
//! ### Events (`events`)
//! - [`LiveSyncEvent`] - Per-device lifecycle events published by the orchestrator
//! - [`PrepareReadyEvent`] - Change descriptor emitted by the prepare pipeline
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `is_fatal` classification
//! - [`TransportError`] - Cloneable device transport errors
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! ```rust
//! use livesync_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{DeviceFailure, Error, Result, ResultExt, TransportError};
pub use events::{LiveSyncEvent, PrepareReadyEvent};
pub use types::{ChangeDescriptor, HotUpdate, Platform, PrepareResult};
