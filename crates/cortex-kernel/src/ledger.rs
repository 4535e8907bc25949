//! Bounded history of finished tasks, chained by SHA-256.
//!
//! Each entry hashes its sequence number, the previous entry's hash and the
//! task itself. Eviction drops the oldest entries; verification starts from
//! whichever entry is oldest in the window.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use cortex_invariants::ContextContributor;
use cortex_protocol::{InvariantContext, Task, TaskId};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub task: Task,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct LedgerState {
    entries: VecDeque<LedgerEntry>,
    next_sequence: u64,
    head: String,
}

#[derive(Debug)]
pub struct TaskLedger {
    capacity: usize,
    state: Mutex<LedgerState>,
}

impl TaskLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LedgerState {
                entries: VecDeque::new(),
                next_sequence: 1,
                head: GENESIS_HASH.to_owned(),
            }),
        }
    }

    /// Append a finished task and return its entry hash.
    pub fn append(&self, task: Task) -> Result<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let sequence = state.next_sequence;
        let hash = entry_hash(sequence, &state.head, &task)?;
        if state.entries.len() == self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(LedgerEntry {
            sequence,
            task,
            prev_hash: state.head.clone(),
            hash: hash.clone(),
        });
        state.next_sequence += 1;
        state.head.clone_from(&hash);
        Ok(hash)
    }

    /// Re-hash every retained entry and check the links between them.
    pub fn verify(&self) -> bool {
        let state = self.state.lock();
        let mut previous: Option<&LedgerEntry> = None;
        for entry in &state.entries {
            if let Some(previous) = previous
                && entry.prev_hash != previous.hash
            {
                warn!(sequence = entry.sequence, "ledger link broken");
                return false;
            }
            match entry_hash(entry.sequence, &entry.prev_hash, &entry.task) {
                Ok(hash) if hash == entry.hash => {}
                _ => {
                    warn!(sequence = entry.sequence, "ledger entry hash mismatch");
                    return false;
                }
            }
            previous = Some(entry);
        }
        previous.is_none_or(|last| last.hash == state.head)
    }

    /// Most recent `limit` tasks, in completion order.
    pub fn recent(&self, limit: usize) -> Vec<Task> {
        let state = self.state.lock();
        let skip = state.entries.len().saturating_sub(limit);
        state
            .entries
            .iter()
            .skip(skip)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn find(&self, id: &TaskId) -> Option<Task> {
        self.state
            .lock()
            .entries
            .iter()
            .rev()
            .find(|entry| &entry.task.id == id)
            .map(|entry| entry.task.clone())
    }

    pub fn head(&self) -> String {
        self.state.lock().head.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, index: usize, goal: &str) {
        if let Some(entry) = self.state.lock().entries.get_mut(index) {
            entry.task.goal = goal.to_owned();
        }
    }
}

fn entry_hash(sequence: u64, prev_hash: &str, task: &Task) -> Result<String> {
    sha256_json(&(sequence, prev_hash, task))
}

fn sha256_json<T: Serialize>(value: &T) -> Result<String> {
    let payload = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&payload))
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Reports ledger verification as the `merkle_valid` invariant flag.
pub struct LedgerContributor {
    ledger: Arc<TaskLedger>,
}

impl LedgerContributor {
    pub fn new(ledger: Arc<TaskLedger>) -> Self {
        Self { ledger }
    }
}

impl ContextContributor for LedgerContributor {
    fn name(&self) -> &str {
        "task-ledger"
    }

    fn contribute(&self, ctx: &mut InvariantContext) {
        ctx.merkle_valid = Some(self.ledger.verify());
    }
}
