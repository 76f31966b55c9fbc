//! Remote git hosting provider.
//!
//! [`RemoteProvider`] is the narrow surface the pipeline needs from a hosting
//! service. Calls are single attempts; callers wrap them in
//! [`crate::retry::RetryExecutor`]. Only GitHub is implemented.

mod error;
mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::ProviderError;
pub use github::{next_page_from_link, GithubProvider};

/// Page size used for branch listing.
pub const BRANCH_PAGE_SIZE: u32 = 100;

/// A branch as reported by the provider at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit_id: String,
    pub protected: bool,
}

impl Branch {
    pub fn new(name: impl Into<String>, commit_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit_id: commit_id.into(),
            protected: false,
        }
    }
}

/// One page of a branch listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchPage {
    pub branches: Vec<Branch>,
    /// Page number to request next, `None` on the last page.
    pub next_page: Option<u32>,
}

/// Kind of a tree entry. Only files are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Other,
}

/// One path of a commit's recursive tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
    /// Provider object id used to fetch the content.
    pub object_id: String,
    /// Git file mode, e.g. `100644` or `100755`.
    pub mode: String,
}

impl TreeEntry {
    pub fn file(path: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            object_id: object_id.into(),
            mode: "100644".to_string(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_executable(&self) -> bool {
        self.mode == "100755"
    }
}

/// Hosting provider operations used by the pipeline.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Succeeds if the repository exists and is readable with our credentials.
    async fn check_access(&self, owner: &str, repo: &str) -> Result<(), ProviderError>;

    /// One page (1-based) of unprotected branches.
    async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<BranchPage, ProviderError>;

    /// Current state of a single branch.
    async fn get_branch(&self, owner: &str, repo: &str, branch: &str)
        -> Result<Branch, ProviderError>;

    /// Full recursive tree of a commit.
    async fn get_tree(
        &self,
        owner: &str,
        repo: &str,
        commit_id: &str,
    ) -> Result<Vec<TreeEntry>, ProviderError>;

    /// Raw content of a file entry.
    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        entry: &TreeEntry,
    ) -> Result<Vec<u8>, ProviderError>;
}
