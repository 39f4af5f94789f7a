//! Pending DO_SYNC operation tracking
//!
//! Every operation is registered with the id of the socket session that
//! carries it and a timeout task. An entry is removed from the map before its
//! channel is completed, so each operation settles exactly once no matter
//! which of report, teardown or timeout gets there first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use livesync_core::prelude::*;

/// Successful end of a DO_SYNC operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub operation_id: String,
    /// Whether the agent reloaded the app in place
    pub did_refresh: bool,
    /// Refresh flag sent with the DO_SYNC frame
    pub requested_refresh: bool,
}

pub type Settlement = std::result::Result<OperationOutcome, TransportError>;

struct PendingOperation {
    session_id: u64,
    settle_tx: oneshot::Sender<Settlement>,
    do_refresh: bool,
    timeout_task: JoinHandle<()>,
}

/// Shared table of in-flight operations
#[derive(Clone, Default)]
pub struct PendingOperations {
    pending: Arc<Mutex<HashMap<String, PendingOperation>>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingOperation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an operation and arm its timeout.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        operation_id: &str,
        session_id: u64,
        do_refresh: bool,
        timeout: Duration,
    ) -> std::result::Result<oneshot::Receiver<Settlement>, TransportError> {
        let mut pending = self.lock();
        if pending.contains_key(operation_id) {
            return Err(TransportError::invalid_frame(format!(
                "Sync operation {operation_id} is already in progress"
            )));
        }

        let (settle_tx, settle_rx) = oneshot::channel();
        let tracker = self.clone();
        let id = operation_id.to_string();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tracker.reject(
                &id,
                TransportError::OperationTimeout {
                    operation_id: id.clone(),
                    timeout,
                },
            ) {
                warn!("Sync operation {} timed out after {:?}", id, timeout);
            }
        });

        pending.insert(
            operation_id.to_string(),
            PendingOperation {
                session_id,
                settle_tx,
                do_refresh,
                timeout_task,
            },
        );

        Ok(settle_rx)
    }

    fn take(&self, operation_id: &str) -> Option<PendingOperation> {
        self.lock().remove(operation_id)
    }

    /// Complete an operation from an end report. Returns `false` for unknown ids.
    pub fn resolve(&self, operation_id: &str, did_refresh: bool) -> bool {
        let Some(operation) = self.take(operation_id) else {
            return false;
        };
        operation.timeout_task.abort();
        let _ = operation.settle_tx.send(Ok(OperationOutcome {
            operation_id: operation_id.to_string(),
            did_refresh,
            requested_refresh: operation.do_refresh,
        }));
        true
    }

    /// Fail a single operation. Returns `false` when it already settled.
    pub fn reject(&self, operation_id: &str, error: TransportError) -> bool {
        let Some(operation) = self.take(operation_id) else {
            return false;
        };
        operation.timeout_task.abort();
        let _ = operation.settle_tx.send(Err(error));
        true
    }

    /// Fail every operation carried by `session_id`; returns how many
    pub fn reject_session(&self, session_id: u64, error: TransportError) -> usize {
        let drained: Vec<PendingOperation> = {
            let mut pending = self.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, op)| op.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = drained.len();
        for operation in drained {
            operation.timeout_task.abort();
            let _ = operation.settle_tx.send(Err(error.clone()));
        }
        count
    }

    pub fn is_in_progress(&self, operation_id: &str) -> bool {
        self.lock().contains_key(operation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
