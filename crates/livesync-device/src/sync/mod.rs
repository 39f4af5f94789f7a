//! Android binary live-sync protocol
//!
//! - [`protocol`] - frame encoding, handshake and report decoding
//! - [`operations`] - pending DO_SYNC operations, settled exactly once
//! - [`client`] - the socket client driving one device + app pair

pub mod client;
pub mod operations;
pub mod protocol;

pub use client::{
    collect_files, resolve_local_host_address, AndroidProcessService, DoSyncOptions,
    LivesyncClient, LivesyncConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT,
    LOCAL_HOST_ADDRESS_ENV,
};
pub use operations::{OperationOutcome, PendingOperations};
pub use protocol::{generate_operation_id, Handshake, Report, ReportDecoder};
