//! Priority tiers, schedule entries, and the lazily-pruned priority heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskDescriptor, TaskId, TaskStatus};

/// Scheduling priority. Declaration order is rank order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// One tier up, saturating at Critical.
    pub fn promoted(&self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A task as the scheduler holds it.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub descriptor: TaskDescriptor,
    pub priority: TaskPriority,
    /// Priority the task was submitted with, before aging.
    pub original_priority: TaskPriority,
    pub scheduled_at: DateTime<Utc>,
    /// Start of the current aging window.
    pub last_promoted_at: DateTime<Utc>,
    /// Position within the tier; lower runs first.
    pub sequence: u64,
    pub requeue_count: u32,
    pub assigned_worker: Option<String>,
    /// Cancelled while held by a worker; the slot is freed on acknowledgement.
    pub cancel_requested: bool,
}

impl ScheduleEntry {
    pub fn task_id(&self) -> &TaskId {
        &self.descriptor.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.descriptor.status
    }
}

/// Heap key. Entries are never removed from the heap directly; a key is
/// live only while its task is queued with the same sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueKey {
    pub rank: u8,
    pub sequence: u64,
    pub task_id: TaskId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap over (rank, FIFO sequence).
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    heap: BinaryHeap<QueueKey>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority, sequence: u64) {
        self.heap.push(QueueKey {
            rank: priority.rank(),
            sequence,
            task_id,
        });
    }

    pub fn push_key(&mut self, key: QueueKey) {
        self.heap.push(key);
    }

    pub fn pop(&mut self) -> Option<QueueKey> {
        self.heap.pop()
    }

    /// Number of keys, including stale ones.
    pub fn raw_len(&self) -> usize {
        self.heap.len()
    }

    /// Replace the heap contents in one O(n) heapify.
    pub fn rebuild(&mut self, keys: Vec<QueueKey>) {
        self.heap = BinaryHeap::from(keys);
    }

    /// Keys in dequeue order, without consuming the heap.
    pub fn ordered_keys(&self) -> Vec<QueueKey> {
        let mut keys = self.heap.clone().into_sorted_vec();
        keys.reverse();
        keys
    }
}
