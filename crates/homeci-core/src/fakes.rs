//! In-memory fakes for the pipeline's collaborators (testing only)
//!
//! `FakeProvider` serves branches, trees and blobs from memory and records
//! every call. `RecordingBuilder` captures build requests and can be told to
//! fail. Combine with `cursor_state::fakes::MemoryCursorStore` and
//! [`crate::naming::SequentialNames`] for fully deterministic runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::build::{BuildError, BuildOutput, BuildRequest, ImageBuilder};
use crate::provider::{Branch, BranchPage, ProviderError, RemoteProvider, TreeEntry};

// ---------------------------------------------------------------------------
// FakeProvider
// ---------------------------------------------------------------------------

/// One call made against a [`FakeProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CheckAccess { repository: String },
    ListBranches { repository: String, page: u32 },
    GetBranch { repository: String, branch: String },
    GetTree { repository: String, commit_id: String },
    GetFile { repository: String, path: String },
}

#[derive(Debug, Default)]
struct FakeRepository {
    branches: Vec<Branch>,
    trees: HashMap<String, Vec<TreeEntry>>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct ProviderState {
    repositories: HashMap<String, FakeRepository>,
    failing_paths: HashSet<String>,
    calls: Vec<ProviderCall>,
}

/// In-memory hosting provider keyed by `owner/repo`.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    fetch_delay: Mutex<Option<Duration>>,
}

fn full_name(owner: &str, repo: &str) -> String {
    format!("{owner}/{repo}")
}

fn not_found(what: String) -> ProviderError {
    ProviderError::Status {
        status: 404,
        url: what,
        body: "Not Found".to_string(),
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `owner/repo` reachable with no branches.
    pub fn add_repository(&self, owner: &str, repo: &str) {
        self.state
            .lock()
            .unwrap()
            .repositories
            .entry(full_name(owner, repo))
            .or_default();
    }

    /// Add or move a branch.
    pub fn set_branch(&self, owner: &str, repo: &str, branch: Branch) {
        let mut state = self.state.lock().unwrap();
        let repository = state.repositories.entry(full_name(owner, repo)).or_default();
        repository.branches.retain(|b| b.name != branch.name);
        repository.branches.push(branch);
    }

    pub fn remove_branch(&self, owner: &str, repo: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(repository) = state.repositories.get_mut(&full_name(owner, repo)) {
            repository.branches.retain(|b| b.name != name);
        }
    }

    /// Add a regular file to `commit_id`'s tree.
    pub fn add_file(&self, owner: &str, repo: &str, commit_id: &str, path: &str, content: &[u8]) {
        let entry = TreeEntry::file(path, format!("{commit_id}:{path}"));
        self.add_entry(owner, repo, commit_id, entry, content);
    }

    /// Add an arbitrary tree entry with content served for its object id.
    pub fn add_entry(
        &self,
        owner: &str,
        repo: &str,
        commit_id: &str,
        entry: TreeEntry,
        content: &[u8],
    ) {
        let mut state = self.state.lock().unwrap();
        let repository = state.repositories.entry(full_name(owner, repo)).or_default();
        repository
            .blobs
            .insert(entry.object_id.clone(), content.to_vec());
        repository
            .trees
            .entry(commit_id.to_string())
            .or_default()
            .push(entry);
    }

    /// Every fetch of `path` fails with a server error.
    pub fn fail_fetches_for(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_paths
            .insert(path.to_string());
    }

    /// Delay every file fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Paths passed to `get_file`, in call order.
    pub fn fetched_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::GetFile { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched_paths().len()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, call: ProviderCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl RemoteProvider for FakeProvider {
    async fn check_access(&self, owner: &str, repo: &str) -> Result<(), ProviderError> {
        let name = full_name(owner, repo);
        self.record(ProviderCall::CheckAccess {
            repository: name.clone(),
        });
        if self.state.lock().unwrap().repositories.contains_key(&name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<BranchPage, ProviderError> {
        let name = full_name(owner, repo);
        self.record(ProviderCall::ListBranches {
            repository: name.clone(),
            page,
        });

        let state = self.state.lock().unwrap();
        let repository = state.repositories.get(&name).ok_or_else(|| not_found(name))?;
        let unprotected: Vec<_> = repository
            .branches
            .iter()
            .filter(|b| !b.protected)
            .cloned()
            .collect();

        let per_page = per_page.max(1) as usize;
        let start = (page.max(1) as usize - 1) * per_page;
        let branches: Vec<_> = unprotected.iter().skip(start).take(per_page).cloned().collect();
        let next_page = (start + per_page < unprotected.len()).then_some(page + 1);
        Ok(BranchPage {
            branches,
            next_page,
        })
    }

    async fn get_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Branch, ProviderError> {
        let name = full_name(owner, repo);
        self.record(ProviderCall::GetBranch {
            repository: name.clone(),
            branch: branch.to_string(),
        });

        let state = self.state.lock().unwrap();
        state
            .repositories
            .get(&name)
            .and_then(|r| r.branches.iter().find(|b| b.name == branch))
            .cloned()
            .ok_or_else(|| not_found(format!("{name}@{branch}")))
    }

    async fn get_tree(
        &self,
        owner: &str,
        repo: &str,
        commit_id: &str,
    ) -> Result<Vec<TreeEntry>, ProviderError> {
        let name = full_name(owner, repo);
        self.record(ProviderCall::GetTree {
            repository: name.clone(),
            commit_id: commit_id.to_string(),
        });

        let state = self.state.lock().unwrap();
        state
            .repositories
            .get(&name)
            .and_then(|r| r.trees.get(commit_id))
            .cloned()
            .ok_or_else(|| not_found(format!("{name}#{commit_id}")))
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        entry: &TreeEntry,
    ) -> Result<Vec<u8>, ProviderError> {
        let name = full_name(owner, repo);
        self.record(ProviderCall::GetFile {
            repository: name.clone(),
            path: entry.path.clone(),
        });

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if state.failing_paths.contains(&entry.path) {
            return Err(ProviderError::Status {
                status: 500,
                url: format!("{name}/{}", entry.path),
                body: "injected failure".to_string(),
            });
        }
        state
            .repositories
            .get(&name)
            .and_then(|r| r.blobs.get(&entry.object_id))
            .cloned()
            .ok_or_else(|| not_found(entry.object_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// RecordingBuilder
// ---------------------------------------------------------------------------

/// A build as seen by [`RecordingBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuild {
    pub dockerfile: String,
    pub tag: String,
    /// Regular files of the context, keyed by relative path.
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    /// Permission bits of the same files.
    pub modes: BTreeMap<PathBuf, u32>,
}

/// Image builder that records requests instead of building.
#[derive(Debug, Default)]
pub struct RecordingBuilder {
    builds: Mutex<Vec<RecordedBuild>>,
    fail: AtomicBool,
}

impl RecordingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder whose every build fails.
    pub fn failing() -> Self {
        let builder = Self::default();
        builder.fail_builds(true);
        builder
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every request received, including failed ones.
    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.lock().unwrap().clone()
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageBuilder for RecordingBuilder {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BuildError> {
        let mut files = BTreeMap::new();
        let mut modes = BTreeMap::new();
        for entry in request.context.entries()? {
            if entry.is_dir {
                continue;
            }
            if let Some(content) = request.context.read_file(&entry.path)? {
                modes.insert(entry.path.clone(), entry.mode);
                files.insert(entry.path, content);
            }
        }

        self.builds.lock().unwrap().push(RecordedBuild {
            dockerfile: request.dockerfile.clone(),
            tag: request.tag.clone(),
            files,
            modes,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(BuildError::Failed {
                code: Some(1),
                stderr: "injected build failure".to_string(),
            });
        }

        Ok(BuildOutput {
            tag: request.tag,
            context_digest: request.context.digest().to_string(),
            log_lines: vec!["Successfully built".to_string()],
            duration_ms: 0,
        })
    }
}
