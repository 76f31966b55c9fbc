//! Concurrent, fail-fast tree download.
//!
//! One task per file entry, at most `max_concurrent` fetching at once. The
//! first failing task cancels the shared scope; tasks that have not started
//! fetching yet give up, in-flight fetches observe their token. The caller
//! always waits for every task to settle before the result is decided.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::PipelineError;
use crate::provider::{ProviderError, RemoteProvider, TreeEntry};
use crate::retry::{until_cancelled, RetryExecutor};

/// Fetches a commit's files into a buffer directory.
#[derive(Clone)]
pub(crate) struct Downloader {
    pub provider: Arc<dyn RemoteProvider>,
    pub retry: RetryExecutor,
    pub owner: Arc<str>,
    pub repo: Arc<str>,
    pub max_concurrent: usize,
}

/// Resolve `relative` under `root`, refusing anything that could leave it.
pub(crate) fn resolve_in(root: &Path, relative: &str) -> Result<PathBuf, PipelineError> {
    let escapes = || PipelineError::PathEscapesBuffer {
        path: relative.to_string(),
    };

    let mut target = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escapes())
            }
        }
    }
    if depth == 0 {
        return Err(escapes());
    }
    Ok(target)
}

impl Downloader {
    /// Write every file entry of `tree` under `dest`. Returns the number of
    /// files written.
    pub async fn download(
        &self,
        tree: Vec<TreeEntry>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        // Every path is checked before the first fetch is issued.
        let files = tree
            .into_iter()
            .filter(TreeEntry::is_file)
            .map(|entry| resolve_in(dest, &entry.path).map(|target| (entry, target)))
            .collect::<Result<Vec<_>, _>>()?;
        let total = files.len();

        let scope = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (entry, target) in files {
            let this = self.clone();
            let scope = scope.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(
                async move {
                    let result = this.fetch_one(&entry, &target, &scope, &permits).await;
                    if result.is_err() {
                        scope.cancel();
                    }
                    result
                }
                .in_current_span(),
            );
        }

        let mut first_error: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                scope.cancel();
                Err(PipelineError::TaskFailed(e.to_string()))
            });
            if let Err(err) = outcome {
                // A real failure outranks the cancellations it caused.
                let replace = match &first_error {
                    None => true,
                    Some(current) => current.is_cancellation() && !err.is_cancellation(),
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(files = total, "Tree downloaded");
                Ok(total)
            }
        }
    }

    async fn fetch_one(
        &self,
        entry: &TreeEntry,
        target: &Path,
        scope: &CancellationToken,
        permits: &Semaphore,
    ) -> Result<(), PipelineError> {
        let _permit = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(PipelineError::Cancelled),
            permit = permits.acquire() => permit.map_err(|_| PipelineError::Cancelled)?,
        };
        if scope.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let provider = &*self.provider;
        let (owner, repo) = (&*self.owner, &*self.repo);
        let content = self
            .retry
            .execute(
                scope,
                move |token| async move {
                    until_cancelled(&token, provider.get_file(owner, repo, entry), || {
                        ProviderError::Cancelled
                    })
                    .await
                },
                |attempt| warn!(path = %entry.path, attempt, "Retrying file download"),
            )
            .await
            .map_err(|source| PipelineError::Retry {
                operation: "fetch file",
                source,
            })?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(PipelineError::io(parent))?;
        }
        tokio::fs::write(target, &content)
            .await
            .map_err(PipelineError::io(target))?;

        #[cfg(unix)]
        if entry.is_executable() {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(PipelineError::io(target))?;
        }

        debug!(path = %entry.path, bytes = content.len(), "File downloaded");
        Ok(())
    }
}
