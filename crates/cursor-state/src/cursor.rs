//! Commit cursor trait and key definitions.
//!
//! A cursor is the last commit id a branch pipeline finished building. The
//! store is the single source of truth for "already built":
//! - `get` returns `None` for a branch that was never built.
//! - `set` overwrites the previous cursor for the same key.
//! - Distinct keys may be written concurrently from different branch loops.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Identifies one watched branch: `(owner, repo, branch)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl CursorKey {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Storage key: the three identifiers joined in one namespace.
    pub fn storage_key(&self) -> String {
        format!("{}.{}.{}", self.owner, self.repo, self.branch)
    }

    /// Reject keys with an empty component.
    pub fn validate(&self) -> StorageResult<()> {
        if self.owner.is_empty() || self.repo.is_empty() || self.branch.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "cursor key has an empty component: {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

/// Durable map from a watched branch to its last built commit.
#[async_trait]
pub trait CommitCursorStore: Send + Sync {
    /// Last built commit for `key`, or `None` if the branch was never built.
    async fn get(&self, key: &CursorKey) -> StorageResult<Option<String>>;

    /// Record `commit_id` as the last built commit for `key`.
    async fn set(&self, key: &CursorKey, commit_id: &str) -> StorageResult<()>;
}
