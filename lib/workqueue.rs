//! Bounded task queue drained by a worker pool.
//!
//! Producers never block the foreground operation: `submit` is a
//! non-blocking send, and when the queue is full it spawns a single
//! supervisor task that waits for space or for shutdown. There is no
//! retry; handler failures are logged. Shutdown closes the channel after
//! the shutdown signal fires, and workers drain what remains before
//! exiting.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::VfsResult;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;
/// Default worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// A bounded work queue with a fixed worker pool.
///
/// `T` is the task payload; the handler runs on a worker and its failures
/// are logged, never retried.
pub struct WorkQueue<T: Send + 'static> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Start `workers` workers draining a channel of `capacity` slots.
    ///
    /// Must be called on a tokio runtime. Zero values fall back to the
    /// defaults.
    pub fn new<H, Fut>(capacity: usize, workers: usize, handler: H) -> Self
    where
        H: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = VfsResult<()>> + Send + 'static,
    {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };

        let (tx, rx) = mpsc::channel::<T>(capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Receiving returns None once the channel is closed
                    // and fully drained, which is the exit condition.
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            if let Err(e) = handler(task).await {
                                warn!(worker_id, error = %e, "task failed");
                            }
                        }
                        None => {
                            debug!(worker_id, "worker exiting");
                            return;
                        }
                    }
                }
            }));
        }

        Self {
            tx: Mutex::new(Some(tx)),
            shutdown_tx,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a task without blocking.
    ///
    /// On a full queue, a supervisor task waits for space or shutdown;
    /// if shutdown wins (or the queue is already closed), `on_dropped`
    /// runs with the task so the caller can clear its bookkeeping.
    pub fn submit<F>(&self, task: T, on_dropped: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let sender = {
            let guard = self.tx.lock().expect("queue sender lock poisoned");
            guard.clone()
        };
        let Some(tx) = sender else {
            on_dropped(task);
            return;
        };

        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(task)) => on_dropped(task),
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("work queue full, task will be queued when space frees");
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    if *shutdown_rx.borrow() {
                        on_dropped(task);
                        return;
                    }
                    tokio::select! {
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit.send(task),
                            Err(_) => on_dropped(task),
                        },
                        _ = shutdown_rx.changed() => on_dropped(task),
                    }
                });
            }
        }
    }

    /// Fire the shutdown signal, close the channel, and wait for the
    /// workers to drain the remaining tasks and exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        drop(self.tx.lock().expect("queue sender lock poisoned").take());

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker set lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!("work queue drained and stopped");
    }
}

impl<T: Send + 'static> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}
