use crate::env;
use crate::task::pool::*;
use crate::task::queue::*;
use crate::task::types::*;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Priority task engine: bounded queue, fixed worker pool, dispatch loop
pub struct TaskEngine {
    shared: Arc<EngineShared>,
    dispatcher: tokio::sync::Mutex<Option<DispatcherHandle>>,
}

/// Configuration for the task engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskEngineConfig {
    /// Number of tasks that may execute at the same time
    pub worker_count: usize,
    /// Maximum number of queued plus running tasks
    pub queue_capacity: usize,
    /// Pause after an unexpected dispatch error
    pub dispatch_backoff_ms: u64,
    /// Finished tasks older than this are dropped; 0 keeps them forever
    pub completed_retention_secs: u64,
}

/// Snapshot of engine counters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub retried_tasks: u64,
    /// Tasks waiting for a worker
    pub queue_size: usize,
    pub running_count: usize,
    /// Queued plus running tasks; submission fails once this reaches `queue_capacity`
    pub queue_occupancy: usize,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub is_running: bool,
}

type CompletedCallback = Arc<dyn Fn(&Task) -> anyhow::Result<()> + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&Task, &str) -> anyhow::Result<()> + Send + Sync>;

/// Completion and failure notifications.
///
/// Callbacks run on the worker that finished the task, after the task has
/// been moved to the finished table. Errors and panics are logged and
/// otherwise ignored. Long-running work should be handed off elsewhere.
#[derive(Clone, Default)]
pub struct EngineCallbacks {
    on_completed: Option<CompletedCallback>,
    on_failed: Option<FailedCallback>,
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_completed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_completed = Some(Arc::new(callback));
        self
    }

    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_failed = Some(Arc::new(callback));
        self
    }
}

struct DispatcherHandle {
    shutdown: CancellationToken,
    dispatch: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct EngineCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

struct EngineShared {
    config: TaskEngineConfig,
    queue: Mutex<TaskQueue>,
    live: DashMap<TaskId, Task>,
    finished: DashMap<TaskId, Task>,
    pool: WorkerPool,
    counters: EngineCounters,
    callbacks: RwLock<EngineCallbacks>,
    running: AtomicBool,
    /// Signalled on every enqueue
    wakeup: Notify,
    /// Signalled whenever a task reaches a terminal state
    terminal: Notify,
    /// Queue occupancy (waiting + leased)
    occupancy: watch::Sender<usize>,
}

enum Dispatch {
    Run(Task),
    Skip,
    Missing,
}

impl TaskEngine {
    /// Create a stopped engine
    pub fn new(config: TaskEngineConfig) -> Self {
        let (occupancy, _) = watch::channel(0);
        let shared = EngineShared {
            queue: Mutex::new(TaskQueue::new(config.queue_capacity)),
            live: DashMap::new(),
            finished: DashMap::new(),
            pool: WorkerPool::new(config.worker_count.max(1)),
            counters: EngineCounters::default(),
            callbacks: RwLock::new(EngineCallbacks::default()),
            running: AtomicBool::new(false),
            wakeup: Notify::new(),
            terminal: Notify::new(),
            occupancy,
            config,
        };

        Self {
            shared: Arc::new(shared),
            dispatcher: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            debug!("Task engine already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));
        let sweeper = spawn_retention_sweeper(Arc::clone(&self.shared), shutdown.clone());

        self.shared.running.store(true, Ordering::SeqCst);
        *dispatcher = Some(DispatcherHandle {
            shutdown,
            dispatch,
            sweeper,
        });

        info!(
            "Task engine started with {} workers (queue capacity {})",
            self.shared.config.worker_count, self.shared.config.queue_capacity
        );
    }

    /// Stop dispatching, abort running tasks and wait for every worker slot
    /// to be handed back. Queued tasks stay queued. Idempotent.
    pub async fn stop(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        let Some(handle) = dispatcher.take() else {
            debug!("Task engine already stopped");
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        handle.shutdown.cancel();

        if let Err(e) = handle.dispatch.await {
            error!("Dispatch loop terminated abnormally: {}", e);
        }
        if let Some(sweeper) = handle.sweeper {
            if let Err(e) = sweeper.await {
                error!("Retention sweeper terminated abnormally: {}", e);
            }
        }

        self.shared.pool.abort_all();
        self.shared.pool.drain().await;

        info!("Task engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Register completion/failure callbacks, replacing any previous ones
    pub fn set_callbacks(&self, callbacks: EngineCallbacks) {
        *self
            .shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callbacks;
    }

    /// Attach `input` to `task` and enqueue it. Returns immediately.
    pub fn submit_task(&self, mut task: Task, input: TaskInput) -> Result<TaskId, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        if task.status != TaskStatus::Pending {
            return Err(EngineError::NotPending {
                id: task.id,
                status: task.status,
            });
        }

        let task_id = task.id;
        if self.shared.live.contains_key(&task_id) || self.shared.finished.contains_key(&task_id) {
            return Err(EngineError::DuplicateTask(task_id));
        }

        task.input = Some(input);
        self.shared.enqueue(task)?;
        self.shared.counters.total.fetch_add(1, Ordering::SeqCst);

        debug!("Submitted task {}", task_id);
        Ok(task_id)
    }

    /// Cancel a task.
    ///
    /// A queued task is guaranteed never to run. A running task is marked
    /// cancelled and its body is aborted at its next suspension point, but
    /// any side effects it already performed are not rolled back. Returns
    /// `false` for unknown or already finished tasks.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let previous = match self.shared.live.get_mut(&task_id) {
            Some(mut task) => {
                let previous = task.status;
                if !task.mark_cancelled() {
                    return false;
                }
                previous
            }
            None => return false,
        };

        self.shared.retire(task_id);
        self.shared.counters.cancelled.fetch_add(1, Ordering::SeqCst);

        match previous {
            TaskStatus::Pending => {
                let mut queue = self.shared.queue();
                if queue.remove(task_id) {
                    self.shared.publish_occupancy(&queue);
                }
                info!("Cancelled queued task {}", task_id);
            }
            _ => {
                self.shared.pool.abort(task_id);
                warn!(
                    "Cancelled running task {}; work already performed is not undone",
                    task_id
                );
            }
        }

        self.shared.terminal.notify_waiters();
        true
    }

    /// Re-enqueue a failed task that still has retries left
    pub fn retry_task(&self, task_id: TaskId) -> Result<TaskId, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let failed = self
            .shared
            .finished
            .get(&task_id)
            .filter(|task| task.can_retry())
            .map(|task| task.clone());
        let Some(mut task) = failed else {
            return Err(self.retry_refusal(task_id));
        };
        task.reset_for_retry();
        let attempt = task.retry_count;

        // Claim the live slot first so the task stays visible throughout
        match self.shared.live.entry(task_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::NotRetryable {
                    id: task_id,
                    reason: "task is already being retried".to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
            }
        }

        if let Err(e) = self.shared.push_queued(&task) {
            self.shared.live.remove(&task_id);
            return Err(e);
        }
        // A fast retry may already have finished again; keep that newer result
        self.shared
            .finished
            .remove_if(&task_id, |_, finished| finished.retry_count < attempt);
        self.shared.counters.retried.fetch_add(1, Ordering::SeqCst);

        info!("Retrying task {} (attempt {})", task_id, attempt);
        Ok(task_id)
    }

    fn retry_refusal(&self, task_id: TaskId) -> EngineError {
        if let Some(task) = self.shared.finished.get(&task_id) {
            let reason = if task.status != TaskStatus::Failed {
                format!("status is {}", task.status)
            } else {
                format!("retry limit of {} reached", task.max_retries)
            };
            return EngineError::NotRetryable {
                id: task_id,
                reason,
            };
        }
        if self.shared.live.contains_key(&task_id) {
            return EngineError::NotRetryable {
                id: task_id,
                reason: "task has not finished".to_string(),
            };
        }
        EngineError::TaskNotFound(task_id)
    }

    pub fn get_task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.get_task_info(task_id).map(|task| task.status)
    }

    /// Snapshot of a task from the live or finished table
    pub fn get_task_info(&self, task_id: TaskId) -> Option<Task> {
        if let Some(task) = self.shared.live.get(&task_id) {
            return Some(task.clone());
        }
        self.shared.finished.get(&task_id).map(|task| task.clone())
    }

    /// Ids of all known tasks whose status matches `status_filter`
    pub fn list_tasks(&self, status_filter: fn(&TaskStatus) -> bool) -> Vec<TaskId> {
        self.shared
            .live
            .iter()
            .chain(self.shared.finished.iter())
            .filter(|entry| status_filter(&entry.value().status))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn get_stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        let queue = self.shared.queue();
        EngineStats {
            total_tasks: counters.total.load(Ordering::SeqCst),
            completed_tasks: counters.completed.load(Ordering::SeqCst),
            failed_tasks: counters.failed.load(Ordering::SeqCst),
            cancelled_tasks: counters.cancelled.load(Ordering::SeqCst),
            retried_tasks: counters.retried.load(Ordering::SeqCst),
            queue_size: queue.len(),
            running_count: self.shared.pool.active(),
            queue_occupancy: queue.occupancy(),
            queue_capacity: queue.capacity(),
            worker_count: self.shared.pool.size(),
            is_running: self.is_running(),
        }
    }

    /// Resolve once the task reaches a terminal state
    pub async fn wait_for_task(&self, task_id: TaskId) -> Result<Task, EngineError> {
        loop {
            let notified = self.shared.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A finished task is inserted into `finished` before it leaves `live`
            let active = self.shared.live.contains_key(&task_id);
            if let Some(task) = self.shared.finished.get(&task_id) {
                return Ok(task.clone());
            }
            if !active {
                return Err(EngineError::TaskNotFound(task_id));
            }

            notified.await;
        }
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        let mut occupancy = self.shared.occupancy.subscribe();
        if occupancy.wait_for(|count| *count == 0).await.is_err() {
            warn!("Occupancy channel closed while waiting for idle engine");
        }
    }

    /// Drop finished tasks that completed before `older_than` ago
    pub fn cleanup_finished_tasks(&self, older_than: chrono::Duration) -> Vec<TaskId> {
        self.shared.prune_finished(older_than)
    }
}

impl EngineShared {
    fn queue(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_occupancy(&self, queue: &TaskQueue) {
        self.occupancy.send_replace(queue.occupancy());
    }

    /// Insert a pending task into the live table and the queue
    fn enqueue(&self, task: Task) -> Result<(), EngineError> {
        let task_id = task.id;
        let entry_source = task.clone();
        self.live.insert(task_id, task);

        if let Err(e) = self.push_queued(&entry_source) {
            self.live.remove(&task_id);
            return Err(e);
        }
        Ok(())
    }

    /// Push a task already present in the live table onto the queue
    fn push_queued(&self, task: &Task) -> Result<(), EngineError> {
        {
            let mut queue = self.queue();
            if let Err(e) = queue.try_push(task) {
                warn!("Rejected task {}: {}", task.id, e);
                return Err(e);
            }
            self.publish_occupancy(&queue);
        }

        self.wakeup.notify_one();
        Ok(())
    }

    /// Wait for the next queue entry
    async fn next_entry(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.queue().pop() {
                return entry;
            }
            self.wakeup.notified().await;
        }
    }

    fn release_lease(&self) {
        let mut queue = self.queue();
        queue.release();
        self.publish_occupancy(&queue);
    }

    /// Move a dequeued task to running, unless it was cancelled meanwhile
    fn begin(&self, entry: &QueueEntry) -> Dispatch {
        match self.live.get_mut(&entry.task_id) {
            Some(mut task) => {
                if task.mark_running() {
                    Dispatch::Run(task.clone())
                } else {
                    Dispatch::Skip
                }
            }
            None if self.finished.contains_key(&entry.task_id) => Dispatch::Skip,
            None => Dispatch::Missing,
        }
    }

    fn launch(self: &Arc<Self>, slot: WorkerSlot, task: Task) {
        let task_id = task.id;
        let input = task.input.unwrap_or_default();
        let body = task.body;
        let shared = Arc::clone(self);

        debug!(
            "Dispatching task {} ({}, priority {:?})",
            task_id, task.name, task.priority
        );

        self.pool.spawn(
            slot,
            task_id,
            async move { body.run(input).await },
            move |outcome| shared.finish_task(task_id, outcome),
        );
    }

    /// Record a worker outcome and notify callbacks
    fn finish_task(&self, task_id: TaskId, outcome: WorkOutcome) {
        let snapshot = match self.live.get_mut(&task_id) {
            Some(mut task) => {
                let applied = match &outcome {
                    WorkOutcome::Succeeded(value) => {
                        task.mark_completed(TaskOutput::success(value.clone()))
                    }
                    WorkOutcome::Failed(error) => task.mark_failed(error.clone()),
                    WorkOutcome::Aborted => task.mark_cancelled(),
                };
                applied.then(|| task.clone())
            }
            None => None,
        };

        self.retire(task_id);
        self.release_lease();

        match snapshot {
            Some(task) => {
                match outcome {
                    WorkOutcome::Succeeded(_) => {
                        self.counters.completed.fetch_add(1, Ordering::SeqCst);
                        info!("Task {} completed", task_id);
                        self.notify_completed(&task);
                    }
                    WorkOutcome::Failed(error) => {
                        self.counters.failed.fetch_add(1, Ordering::SeqCst);
                        warn!("Task {} failed: {}", task_id, error);
                        self.notify_failed(&task, &error);
                    }
                    WorkOutcome::Aborted => {
                        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                        info!("Task {} aborted during shutdown", task_id);
                    }
                }
                self.terminal.notify_waiters();
            }
            None => debug!("Discarded outcome of already finished task {}", task_id),
        }
    }

    /// Copy a terminal task into the finished table, then drop it from the live one
    fn retire(&self, task_id: TaskId) {
        let snapshot = self.live.get(&task_id).map(|task| task.clone());
        if let Some(task) = snapshot {
            if task.is_terminal() {
                self.finished.insert(task_id, task);
                self.live.remove(&task_id);
            }
        }
    }

    fn notify_completed(&self, task: &Task) {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_completed
            .clone();
        if let Some(callback) = callback {
            match catch_unwind(AssertUnwindSafe(|| callback(task))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Completion callback for task {} failed: {}", task.id, e),
                Err(_) => error!("Completion callback for task {} panicked", task.id),
            }
        }
    }

    fn notify_failed(&self, task: &Task, failure: &str) {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_failed
            .clone();
        if let Some(callback) = callback {
            match catch_unwind(AssertUnwindSafe(|| callback(task, failure))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failure callback for task {} failed: {}", task.id, e),
                Err(_) => error!("Failure callback for task {} panicked", task.id),
            }
        }
    }

    fn prune_finished(&self, older_than: chrono::Duration) -> Vec<TaskId> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return Vec::new();
        };
        let expired: Vec<TaskId> = self
            .finished
            .iter()
            .filter(|entry| entry.completed_at.is_some_and(|at| at < cutoff))
            .map(|entry| *entry.key())
            .collect();

        for task_id in &expired {
            self.finished.remove(task_id);
        }

        if !expired.is_empty() {
            info!("Cleaned up {} finished tasks", expired.len());
        }
        expired
    }
}

async fn dispatch_loop(shared: Arc<EngineShared>, shutdown: CancellationToken) {
    let backoff = Duration::from_millis(shared.config.dispatch_backoff_ms);
    debug!("Dispatch loop running");

    loop {
        // Take a slot first so the task is chosen only once it can actually run
        let slot = tokio::select! {
            _ = shutdown.cancelled() => break,
            slot = shared.pool.acquire_slot() => slot,
        };
        let Some(slot) = slot else {
            error!("Worker pool closed, dispatch loop exiting");
            break;
        };

        let entry = tokio::select! {
            _ = shutdown.cancelled() => break,
            entry = shared.next_entry() => entry,
        };

        match shared.begin(&entry) {
            Dispatch::Run(task) => shared.launch(slot, task),
            Dispatch::Skip => {
                debug!("Skipping cancelled task {}", entry.task_id);
                shared.release_lease();
            }
            Dispatch::Missing => {
                error!("Queue entry for unknown task {}, backing off", entry.task_id);
                shared.release_lease();
                drop(slot);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    debug!("Dispatch loop exited");
}

fn spawn_retention_sweeper(
    shared: Arc<EngineShared>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let retention_secs = shared.config.completed_retention_secs;
    if retention_secs == 0 {
        return None;
    }
    let retention = i64::try_from(retention_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX);
    let period = Duration::from_secs((retention_secs / 4).clamp(1, 60));

    Some(tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    shared.prune_finished(retention);
                }
            }
        }
    }))
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            worker_count: env::DEFAULT_WORKER_COUNT,
            queue_capacity: env::DEFAULT_TASK_QUEUE_CAPACITY,
            dispatch_backoff_ms: env::DEFAULT_DISPATCH_BACKOFF_MS,
            completed_retention_secs: env::DEFAULT_COMPLETED_RETENTION_SECS,
        }
    }
}

impl TaskEngineConfig {
    /// Check the configuration is usable
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("engine.worker_count must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("engine.queue_capacity must be at least 1");
        }
        if self.queue_capacity < self.worker_count {
            warn!(
                "engine.queue_capacity ({}) is below engine.worker_count ({}); \
                 at most {} tasks will run at once",
                self.queue_capacity, self.worker_count, self.queue_capacity
            );
        }
        Ok(())
    }
}
