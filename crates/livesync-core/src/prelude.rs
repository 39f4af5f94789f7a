//! Prelude for common imports used throughout the livesync crates

pub use crate::error::{Error, Result, ResultExt, TransportError};
pub use tracing::{debug, error, info, instrument, trace, warn};
