use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use uuid::Uuid;

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: u32,
    submission: usize,
    job_id: Uuid,
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submission.cmp(&self.submission))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queued jobs of the active run, ordered by priority and then by
/// submission order (FIFO within a priority class).
#[derive(Debug)]
pub struct Backlog {
    heap: BinaryHeap<Entry>,
    members: HashSet<Uuid>,
    max_jobs: usize,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new()
    }
}

impl Backlog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            members: HashSet::new(),
            max_jobs,
        }
    }

    /// Add a job. Returns false if it is already queued or the backlog is
    /// at capacity. A retried job keeps its original submission index, so it
    /// goes ahead of later submissions of the same priority.
    pub fn push(&mut self, job_id: Uuid, priority: u32, submission: usize) -> bool {
        if self.members.len() >= self.max_jobs || !self.members.insert(job_id) {
            return false;
        }
        self.heap.push(Entry {
            priority,
            submission,
            job_id,
        });
        true
    }

    /// Next job to dispatch without removing it.
    pub fn peek(&self) -> Option<Uuid> {
        self.heap.peek().map(|e| e.job_id)
    }

    pub fn pop(&mut self) -> Option<Uuid> {
        let entry = self.heap.pop()?;
        self.members.remove(&entry.job_id);
        Some(entry.job_id)
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.members.contains(job_id)
    }

    /// Removes every queued job, in dispatch order.
    pub fn drain(&mut self) -> Vec<Uuid> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(id) = self.pop() {
            drained.push(id);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_jobs
    }
}
