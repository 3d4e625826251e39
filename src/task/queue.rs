use crate::task::types::*;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Entry in the pending queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then older tasks, then earlier enqueue
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

/// Bounded priority queue of pending tasks.
///
/// Entries handed out by [`TaskQueue::pop`] stay leased until
/// [`TaskQueue::release`] is called, and leased entries count against the
/// capacity. A task therefore keeps its queue slot until its worker is done
/// with it.
#[derive(Debug)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    capacity: usize,
    leased: usize,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            leased: 0,
            next_seq: 0,
        }
    }

    /// Enqueue a task, failing fast when the queue is at capacity
    pub fn try_push(&mut self, task: &Task) -> Result<(), EngineError> {
        if self.is_full() {
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }

        self.heap.push(QueueEntry {
            task_id: task.id,
            priority: task.priority,
            created_at: task.created_at,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Take the most urgent entry and lease it
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.heap.pop()?;
        self.leased += 1;
        Some(entry)
    }

    /// Return a leased slot once its task has finished or been skipped
    pub fn release(&mut self) {
        self.leased = self.leased.saturating_sub(1);
    }

    /// Drop a not-yet-dispatched entry
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.task_id != task_id);
        self.heap.len() != before
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek()
    }

    /// Number of entries waiting for dispatch
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn leased(&self) -> usize {
        self.leased
    }

    /// Waiting plus leased entries
    pub fn occupancy(&self) -> usize {
        self.heap.len() + self.leased
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() >= self.capacity
    }
}
