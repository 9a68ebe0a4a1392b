//! Row locks
//!
//! Keyed async mutexes standing in for `SELECT ... FOR UPDATE`. A caller that
//! needs several rows goes through [`RowLocks::lock_all`], which sorts the keys
//! first so every task acquires them in the same global order.
//!
//! A row stays in the table only while a task holds or waits for it.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type RowTable = DashMap<String, Arc<Mutex<()>>>;

/// Guard for one locked row; dropping it releases the row
#[derive(Debug)]
pub struct RowGuard {
    key: String,
    rows: Arc<RowTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RowGuard {
    /// Locked row key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table still references the mutex: nobody holds or awaits it
        self.rows
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Table of row locks keyed by `"<table>:<id>"`
#[derive(Debug)]
pub struct RowLocks {
    rows: Arc<RowTable>,
    timeout: Duration,
}

impl RowLocks {
    /// Create with a per-row acquisition timeout
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Row key helper
    pub fn key(table: &str, id: impl std::fmt::Display) -> String {
        format!("{}:{}", table, id)
    }

    /// Acquire one row
    pub async fn lock(&self, key: impl Into<String>) -> Result<RowGuard> {
        let key = key.into();
        let mutex = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(RowGuard {
                key,
                rows: self.rows.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                // Drop the row unless another task holds or awaits it
                self.rows
                    .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
                tracing::warn!(row = %key, timeout_ms = self.timeout.as_millis() as u64, "Row lock timed out");
                Err(Error::LockTimeout(key))
            }
        }
    }

    /// Acquire several rows in canonical (sorted, deduplicated) order
    pub async fn lock_all<I, K>(&self, keys: I) -> Result<Vec<RowGuard>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await?);
        }
        Ok(guards)
    }

    /// Rows currently held or awaited
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// No row is held or awaited
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
