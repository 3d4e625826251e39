use crate::task::types::TaskId;
use dashmap::DashMap;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Fixed-size set of execution slots.
///
/// Each task body runs in its own tokio task so that a panic or an abort only
/// affects that body; a supervising task waits for it, turns the result into a
/// [`WorkOutcome`] and hands the slot back.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    handles: Arc<DashMap<TaskId, AbortHandle>>,
    active: Arc<AtomicUsize>,
}

/// A reserved execution slot; dropping it frees the slot
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

/// How a task body ended
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
    Aborted,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            handles: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bodies currently executing
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for a free slot. Returns `None` only if the pool was closed.
    pub async fn acquire_slot(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;
        Some(WorkerSlot { _permit: permit })
    }

    /// Run `work` on `slot`, then call `finish` with the outcome and free the slot
    pub fn spawn<W, F>(&self, slot: WorkerSlot, task_id: TaskId, work: W, finish: F)
    where
        W: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
        F: FnOnce(WorkOutcome) + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let body = tokio::spawn(work);
        self.handles.insert(task_id, body.abort_handle());

        let handles = Arc::clone(&self.handles);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let outcome = match body.await {
                Ok(Ok(value)) => WorkOutcome::Succeeded(value),
                Ok(Err(e)) => WorkOutcome::Failed(format!("{:#}", e)),
                Err(e) if e.is_cancelled() => WorkOutcome::Aborted,
                Err(e) => WorkOutcome::Failed(format!(
                    "task panicked: {}",
                    panic_message(e.into_panic())
                )),
            };
            handles.remove(&task_id);
            finish(outcome);
            active.fetch_sub(1, Ordering::SeqCst);
            drop(slot);
        });

        debug!("Spawned worker for task {}", task_id);
    }

    /// Request cancellation of a running body. Best effort: the body stops at
    /// its next suspension point, side effects already performed remain.
    pub fn abort(&self, task_id: TaskId) -> bool {
        match self.handles.get(&task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for handle in self.handles.iter() {
            handle.value().abort();
            aborted += 1;
        }
        if aborted > 0 {
            warn!("Aborted {} running task(s)", aborted);
        }
        aborted
    }

    /// Wait until every slot has been handed back
    pub async fn drain(&self) {
        match self.slots.acquire_many(self.size as u32).await {
            Ok(permits) => drop(permits),
            Err(_) => warn!("Worker pool closed while draining"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
