//! Per-project action chain
//!
//! Every workflow of a project (initial sync, change batches) is appended to
//! one chain and executed by a single worker task, strictly one at a time in
//! append order. Once the chain is stopped, queued jobs are skipped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use livesync_core::prelude::*;

struct QueuedJob {
    sequence: u64,
    job: BoxFuture<'static, ()>,
    done: oneshot::Sender<()>,
}

/// FIFO job queue with a single worker
pub struct ActionChain {
    name: String,
    /// Next sequence number; sending happens under this lock to keep order
    sender: Mutex<(u64, mpsc::UnboundedSender<QueuedJob>)>,
    stopped: Arc<AtomicBool>,
    /// Sequence of the running job, 0 when idle
    running: Arc<AtomicU64>,
    completed: watch::Receiver<u64>,
}

impl ActionChain {
    /// Create the chain and spawn its worker
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedJob>();
        let (completed_tx, completed) = watch::channel(0u64);
        let stopped = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicU64::new(0));

        let worker_stopped = stopped.clone();
        let worker_running = running.clone();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(QueuedJob {
                sequence,
                job,
                done,
            }) = receiver.recv().await
            {
                if worker_stopped.load(Ordering::SeqCst) {
                    trace!("[{}] skipping action {} (stopped)", worker_name, sequence);
                } else {
                    worker_running.store(sequence, Ordering::SeqCst);
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("[{}] action {} panicked", worker_name, sequence);
                    }
                    worker_running.store(0, Ordering::SeqCst);
                }
                completed_tx.send_modify(|last| *last = (*last).max(sequence));
                let _ = done.send(());
            }
            trace!("[{}] action chain closed", worker_name);
        });

        Self {
            name,
            sender: Mutex::new((0, sender)),
            stopped,
            running,
            completed,
        }
    }

    /// Queue a job; the receiver fires once it ran or was skipped
    pub fn append<F>(&self, job: F) -> oneshot::Receiver<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, done_rx) = oneshot::channel();
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender.0 += 1;
        let queued = QueuedJob {
            sequence: sender.0,
            job: Box::pin(job),
            done,
        };
        if sender.1.send(queued).is_err() {
            warn!("[{}] action chain worker is gone", self.name);
        }
        done_rx
    }

    /// Mark stopped; queued jobs become no-ops
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the job running right now, if any
    pub async fn wait_for_current(&self) {
        let current = self.running.load(Ordering::SeqCst);
        if current != 0 {
            self.wait_for(current).await;
        }
    }

    /// Wait for every job appended so far
    pub async fn wait_for_tail(&self) {
        let tail = self.sender.lock().unwrap_or_else(|e| e.into_inner()).0;
        self.wait_for(tail).await;
    }

    async fn wait_for(&self, sequence: u64) {
        let mut completed = self.completed.clone();
        let _ = completed.wait_for(|last| *last >= sequence).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_jobs_run_in_append_order() {
        let chain = ActionChain::new("test");
        let order = recorder();

        for i in 0..5u32 {
            let order = order.clone();
            chain.append(async move {
                // Earlier jobs sleep longer; order must still hold
                tokio::time::sleep(Duration::from_millis(u64::from(5 - i) * 5)).await;
                order.lock().unwrap().push(i);
            });
        }

        chain.wait_for_tail().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stopped_chain_skips_queued_jobs() {
        let chain = ActionChain::new("test");
        let order = recorder();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = order.clone();
        chain.append(async move {
            let _ = release_rx.await;
            first.lock().unwrap().push(1);
        });
        let second = order.clone();
        let skipped = chain.append(async move {
            second.lock().unwrap().push(2);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        chain.stop();
        release_tx.send(()).unwrap();

        skipped.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1]);
        assert!(chain.is_stopped());

        chain.resume();
        let third = order.clone();
        chain
            .append(async move {
                third.lock().unwrap().push(3);
            })
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_wait_for_current() {
        let chain = ActionChain::new("test");
        let order = recorder();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let first = order.clone();
        chain.append(async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
            first.lock().unwrap().push(1);
        });

        started_rx.await.unwrap();
        chain.wait_for_current().await;
        assert_eq!(*order.lock().unwrap(), vec![1]);

        // Idle chain returns immediately
        tokio::time::timeout(Duration::from_millis(100), chain.wait_for_current())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_break_chain() {
        let chain = ActionChain::new("test");
        let order = recorder();

        chain.append(async {
            panic!("job failed");
        });
        let next = order.clone();
        chain
            .append(async move {
                next.lock().unwrap().push(2);
            })
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![2]);
    }
}
