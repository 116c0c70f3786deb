//! In-process [`FlowStore`], used for dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::errors::StoreError;
use crate::flow::FlowRow;

use super::FlowStore;

/// Keeps appended rows in memory.
///
/// Can be switched offline (every write fails) or given a predicate that
/// rejects individual rows, to exercise the sink's failure paths.
pub struct MemoryStore {
    rows: Mutex<Vec<FlowRow>>,
    offline: AtomicBool,
    reject: Option<fn(&FlowRow) -> bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            reject: None,
        }
    }

    /// Reject every row for which `predicate` returns true.
    pub fn with_rejection(mut self, predicate: fn(&FlowRow) -> bool) -> Self {
        self.reject = Some(predicate);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of every row written so far.
    pub fn rows(&self) -> Vec<FlowRow> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FlowStore for MemoryStore {
    async fn append(&self, rows: &[FlowRow]) -> Result<usize, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailure("memory store is offline".into()));
        }

        let mut stored = self
            .rows
            .lock()
            .map_err(|_| StoreError::WriteFailure("memory store lock poisoned".into()))?;

        let mut rejected = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            if self.reject.is_some_and(|reject| reject(row)) {
                rejected.push(idx);
            } else {
                stored.push(row.clone());
            }
        }

        let accepted = rows.len() - rejected.len();
        if rejected.is_empty() {
            Ok(accepted)
        } else {
            Err(StoreError::PartialBatchRejection { accepted, rejected })
        }
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
