//! In-memory fakes for the cursor store (testing only)
//!
//! `MemoryCursorStore` satisfies the `CommitCursorStore` contract without any
//! external dependencies and records every write so tests can assert on
//! cursor-update ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cursor::{CommitCursorStore, CursorKey, StorageResult};
use crate::error::StorageError;

/// In-memory cursor store backed by a `HashMap<storage key, commit>`.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(CursorKey, String)>>,
    fail_writes: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail with a query error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every successful `set`, in call order.
    pub fn writes(&self) -> Vec<(CursorKey, String)> {
        self.writes.lock().unwrap().clone()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl CommitCursorStore for MemoryCursorStore {
    async fn get(&self, key: &CursorKey) -> StorageResult<Option<String>> {
        key.validate()?;
        let cursors = self.cursors.lock().unwrap();
        Ok(cursors.get(&key.storage_key()).cloned())
    }

    async fn set(&self, key: &CursorKey, commit_id: &str) -> StorageResult<()> {
        key.validate()?;
        if commit_id.is_empty() {
            return Err(StorageError::InvalidInput("empty commit id".to_string()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Query(format!(
                "injected write failure for {}",
                key.storage_key()
            )));
        }
        self.cursors
            .lock()
            .unwrap()
            .insert(key.storage_key(), commit_id.to_string());
        self.writes
            .lock()
            .unwrap()
            .push((key.clone(), commit_id.to_string()));
        Ok(())
    }
}
