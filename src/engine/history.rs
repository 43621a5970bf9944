// Bounded execution history

use std::collections::VecDeque;

use crate::models::{ExecutionRecord, HistoryFilter};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Ring buffer of execution records in arrival order
///
/// Once full, each push evicts the oldest record. Reads clone, so callers
/// never hold references into the buffer.
#[derive(Debug, Clone)]
pub struct History {
    records: VecDeque<ExecutionRecord>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent `limit` records accepted by `filter`, oldest first
    pub fn query(&self, limit: usize, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        let mut matched: Vec<ExecutionRecord> = self
            .records
            .iter()
            .rev()
            .filter(|record| filter.accepts(record))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }
}
