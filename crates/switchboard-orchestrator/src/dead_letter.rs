use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use switchboard_core::{RoutingFailure, SkillRequest, TaskId};

/// A task that failed because no agent could take it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub skill: SkillRequest,
    pub reason: RoutingFailure,
    pub at: DateTime<Utc>,
}

/// Bounded record of routing failures. The oldest entry is evicted once
/// `capacity` is reached.
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, letter: DeadLetter) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Entries oldest first.
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn letter() -> DeadLetter {
        DeadLetter {
            task_id: TaskId::new(),
            skill: SkillRequest::new("summarize"),
            reason: RoutingFailure::NoEligibleAgent,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2);
        let first = letter();
        let first_id = first.task_id;
        dlq.push(first);
        dlq.push(letter());
        dlq.push(letter());
        assert_eq!(dlq.len(), 2);
        assert!(dlq.list().iter().all(|l| l.task_id != first_id));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let dlq = DeadLetterQueue::new(0);
        dlq.push(letter());
        assert!(dlq.is_empty());
    }
}
