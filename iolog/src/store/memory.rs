//! Process-local audit store

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::AuditStore;
use crate::error::{Error, Result};
use crate::recorder::AuditLogEntry;

struct Inner {
    next_id: i64,
    entries: VecDeque<AuditLogEntry>,
}

/// Audit store backed by a queue behind a mutex
///
/// With a capacity set, the oldest records are evicted first. The lock is never
/// held across an `.await`.
pub struct InMemoryAuditStore {
    inner: Mutex<Inner>,
    capacity: Option<usize>,
}

impl InMemoryAuditStore {
    /// Unbounded store
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Store keeping at most `capacity` records when set
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Snapshot of every retained record in insertion order
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        match self.inner.lock() {
            Ok(inner) => inner.entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn save(&self, entry: &AuditLogEntry) -> Result<i64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("in-memory audit store lock poisoned".to_string()))?;

        let id = inner.next_id;
        inner.next_id += 1;

        let mut entry = entry.clone();
        entry.id = Some(id);
        inner.entries.push_back(entry);

        if let Some(capacity) = self.capacity {
            while inner.entries.len() > capacity {
                inner.entries.pop_front();
            }
        }

        Ok(id)
    }

    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Vec<AuditLogEntry>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("in-memory audit store lock poisoned".to_string()))?;

        let mut found: Vec<AuditLogEntry> = inner
            .entries
            .iter()
            .filter(|entry| entry.trace_id == trace_id)
            .cloned()
            .collect();
        found.sort_by_key(|entry| entry.timestamp);
        Ok(found)
    }
}
