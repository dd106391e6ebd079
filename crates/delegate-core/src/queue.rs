//! Bounded priority queue of tasks.
//!
//! A binary min-heap keyed by (priority, insertion counter): P0 dequeues
//! first, FIFO within equal priority. A sidecar index mapping task ID to
//! heap position is kept in sync on every swap, making `contains` and
//! `remove` O(1) lookups (plus the O(log n) re-heapify for remove).

use std::collections::HashMap;

use uuid::Uuid;

use delegate_db::models::{Task, TaskPriority};

use crate::error::DelegateError;

#[derive(Debug, Clone)]
struct QueueEntry {
    task: Task,
    seq: u64,
}

/// Bounded task queue ordered by (priority, FIFO).
#[derive(Debug)]
pub struct TaskQueue {
    heap: Vec<QueueEntry>,
    index: HashMap<Uuid, usize>,
    seq: u64,
    max_size: usize,
    /// When false, all priorities compare equal (pure FIFO).
    prioritised: bool,
}

impl TaskQueue {
    /// A priority queue bounded at `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            seq: 0,
            max_size,
            prioritised: true,
        }
    }

    /// The FIFO variant: identical behaviour except every priority
    /// compares equal. Exists for tests that need insertion order alone.
    pub fn fifo(max_size: usize) -> Self {
        Self {
            prioritised: false,
            ..Self::new(max_size)
        }
    }

    fn key(&self, entry: &QueueEntry) -> (TaskPriority, u64) {
        if self.prioritised {
            (entry.task.priority, entry.seq)
        } else {
            (TaskPriority::P1, entry.seq)
        }
    }

    /// Add a task. Fails with `RESOURCE_EXHAUSTED` at capacity and with
    /// `INVALID_OPERATION` if the task is already queued.
    pub fn enqueue(&mut self, task: Task) -> Result<(), DelegateError> {
        if self.heap.len() >= self.max_size {
            return Err(DelegateError::ResourceExhausted(format!(
                "queue is full ({} tasks)",
                self.max_size
            )));
        }
        if self.index.contains_key(&task.id) {
            return Err(DelegateError::InvalidOperation(format!(
                "task {} is already queued",
                task.id
            )));
        }

        self.seq += 1;
        let entry = QueueEntry {
            task,
            seq: self.seq,
        };
        let id = entry.task.id;
        self.heap.push(entry);
        let pos = self.heap.len() - 1;
        self.index.insert(id, pos);
        self.sift_up(pos);
        Ok(())
    }

    /// Remove and return the highest-priority (then oldest) task.
    pub fn dequeue(&mut self) -> Option<Task> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0).task)
    }

    /// The task `dequeue` would return, without removing it.
    pub fn peek(&self) -> Option<&Task> {
        self.heap.first().map(|e| &e.task)
    }

    /// Remove a specific task by ID. Returns it if present.
    pub fn remove(&mut self, task_id: &Uuid) -> Option<Task> {
        let pos = *self.index.get(task_id)?;
        Some(self.remove_at(pos).task)
    }

    /// Whether the task is currently queued. O(1).
    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.index.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every queued task.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Snapshot of all queued tasks in dequeue order.
    pub fn snapshot(&self) -> Vec<Task> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by_key(|e| self.key(e));
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    // -- heap internals ----------------------------------------------------

    fn remove_at(&mut self, pos: usize) -> QueueEntry {
        let last = self.heap.len() - 1;
        self.swap(pos, last);
        let entry = self.heap.pop().expect("heap not empty");
        self.index.remove(&entry.task.id);
        if pos < self.heap.len() {
            // The element moved into `pos` may violate either direction.
            self.sift_down(pos);
            self.sift_up(pos);
        }
        entry
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].task.id, a);
        self.index.insert(self.heap[b].task.id, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.key(&self.heap[pos]) < self.key(&self.heap[parent]) {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.heap.len()
                && self.key(&self.heap[left]) < self.key(&self.heap[smallest])
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.key(&self.heap[right]) < self.key(&self.heap[smallest])
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
