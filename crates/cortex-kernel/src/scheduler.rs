//! Priority task queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use cortex_protocol::{Priority, TaskId};

/// Queue entry. `seq` is the arrival number and breaks priority ties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: Priority,
    pub seq: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Strict priority order (`critical > high > normal > low`), FIFO within a
/// priority.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn push(&mut self, task_id: TaskId, priority: Priority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask {
            task_id,
            priority,
            seq,
        });
        seq
    }

    /// Put a claimed entry back with its original position.
    pub fn restore(&mut self, entry: QueuedTask) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove everything, in dequeue order.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            drained.push(entry);
        }
        drained
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut entries: Vec<_> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.task_id.clone()).collect()
    }
}
