//! Fixed pool of media workers with round-robin room placement

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::{MediaEngine, MediaWorker};
use crate::error::{Error, Result};
use crate::types::WorkerId;

/// Workers are spawned once at startup and never replaced. A crashed worker
/// stays in the rotation and surfaces as `WorkerFatal` when selected; the
/// host decides whether to keep the process alive.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    cursor: AtomicUsize,
    /// Receiver for dead-worker notifications (taken once by the host)
    fatal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<WorkerId>>>,
}

impl WorkerPool {
    pub(crate) async fn new(engine: &Arc<dyn MediaEngine>, count: usize) -> Result<Self> {
        let count = count.max(1);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = engine.create_worker().await?;
            let worker_id = worker.id();
            let tx = fatal_tx.clone();
            worker.on_died(Box::new(move || {
                warn!(worker_id = %worker_id, "Media worker died");
                let _ = tx.send(worker_id.clone());
            }));
            workers.push(worker);
        }

        info!(worker_count = workers.len(), "Worker pool ready");
        Ok(Self {
            workers,
            cursor: AtomicUsize::new(0),
            fatal_rx: parking_lot::Mutex::new(Some(fatal_rx)),
        })
    }

    /// Pick the next worker in rotation for a new room.
    pub(crate) fn assign_worker(&self) -> Result<Arc<dyn MediaWorker>> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        if !worker.is_alive() {
            return Err(Error::WorkerFatal {
                worker_id: worker.id(),
            });
        }
        Ok(Arc::clone(worker))
    }

    /// Take the dead-worker receiver (can only be called once).
    pub(crate) fn take_fatal_receiver(&self) -> Option<mpsc::UnboundedReceiver<WorkerId>> {
        self.fatal_rx.lock().take()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) async fn close(&self) {
        for worker in &self.workers {
            worker.close().await;
        }
    }
}
