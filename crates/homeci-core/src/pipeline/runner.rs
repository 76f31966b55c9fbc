//! Per-repository branch pipeline runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cursor_state::{CommitCursorStore, CursorKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::download::Downloader;
use super::{buffer_dir_name, BranchMatcher, PipelineError};
use crate::build::{BuildContext, BuildRequest, ImageBuilder};
use crate::config::{BranchPipelineConfig, RepositoryConfig};
use crate::naming::NameSource;
use crate::provider::{Branch, ProviderError, RemoteProvider, TreeEntry, BRANCH_PAGE_SIZE};
use crate::retry::{until_cancelled, RetryExecutor};

/// Collaborators shared by every runner of one configuration.
#[derive(Clone)]
pub struct PipelineServices {
    pub provider: Arc<dyn RemoteProvider>,
    pub cursors: Arc<dyn CommitCursorStore>,
    pub builder: Arc<dyn ImageBuilder>,
    pub names: Arc<dyn NameSource>,
    pub retry: RetryExecutor,
    pub buffer_root: PathBuf,
    pub poll_interval: Duration,
    pub max_concurrent_downloads: usize,
}

/// A discovered branch bound to the pipeline that builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchWatch {
    pub branch: String,
    pub pipeline: BranchPipelineConfig,
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The cursor already pointed at the branch head.
    UpToDate { commit_id: String },
    /// A new commit was built and recorded.
    Built {
        commit_id: String,
        tag: String,
        files: usize,
    },
}

/// Watches the branches of one repository.
pub struct BranchPipelineRunner {
    repository: Arc<RepositoryConfig>,
    services: PipelineServices,
    owner: Arc<str>,
    repo: Arc<str>,
    span: Span,
}

impl BranchPipelineRunner {
    pub fn new(repository: Arc<RepositoryConfig>, services: PipelineServices) -> Self {
        let span = info_span!("repository", repository = %repository.full_name());
        Self {
            owner: Arc::from(repository.owner.as_str()),
            repo: Arc::from(repository.repo.as_str()),
            repository,
            services,
            span,
        }
    }

    pub fn repository(&self) -> &RepositoryConfig {
        &self.repository
    }

    pub fn buffer_root(&self) -> &Path {
        &self.services.buffer_root
    }

    pub fn cursor_key(&self, branch: &str) -> CursorKey {
        CursorKey::new(&*self.owner, &*self.repo, branch)
    }

    /// Scratch directory of `branch` for one iteration.
    pub fn buffer_dir(&self, branch: &str) -> PathBuf {
        self.services
            .buffer_root
            .join(buffer_dir_name(&self.repo, branch))
    }

    /// List unprotected branches and bind each to its first matching pipeline.
    pub async fn discover_branches(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<BranchWatch>, PipelineError> {
        async {
            let matcher = BranchMatcher::compile(&self.repository.branch_pipelines)?;
            let provider = &*self.services.provider;
            let (owner, repo) = (&*self.owner, &*self.repo);

            let mut watches = Vec::new();
            let mut page = 1u32;
            loop {
                let listing = self
                    .services
                    .retry
                    .execute(
                        cancel,
                        move |token| async move {
                            until_cancelled(
                                &token,
                                provider.list_branches(owner, repo, page, BRANCH_PAGE_SIZE),
                                || ProviderError::Cancelled,
                            )
                            .await
                        },
                        |attempt| warn!(page, attempt, "Retrying branch listing"),
                    )
                    .await
                    .map_err(|source| PipelineError::Retry {
                        operation: "list branches",
                        source,
                    })?;

                for branch in listing.branches.into_iter().filter(|b| !b.protected) {
                    match matcher.match_branch(&branch.name) {
                        Some(index) => watches.push(BranchWatch {
                            branch: branch.name,
                            pipeline: self.repository.branch_pipelines[index].clone(),
                        }),
                        None => debug!(branch = %branch.name, "Branch matches no template"),
                    }
                }

                match listing.next_page {
                    Some(next) if next > page => page = next,
                    _ => break,
                }
            }

            info!(matched = watches.len(), "Branches discovered");
            Ok::<_, PipelineError>(watches)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Run `watch` until `cancel` fires: one iteration, then the poll
    /// interval, repeated. Iteration failures are logged and never end the loop.
    pub async fn watch_branch(&self, watch: BranchWatch, cancel: CancellationToken) {
        let span = info_span!(parent: &self.span, "branch", branch = %watch.branch);
        async {
            info!(template = %watch.pipeline.template, "Watching branch");
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match self.run_iteration(&watch, &cancel).await {
                    Ok(_) => {}
                    Err(e) if e.is_cancellation() && cancel.is_cancelled() => break,
                    Err(e) => error!(error = %e, "Pipeline iteration failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.services.poll_interval) => {}
                }
            }
            info!("Stopped watching branch");
        }
        .instrument(span)
        .await
    }

    /// One detect, download, build, persist pass for `watch`.
    ///
    /// The cursor is written only after a successful build. The buffer
    /// directory never outlives this call.
    pub async fn run_iteration(
        &self,
        watch: &BranchWatch,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, PipelineError> {
        let key = self.cursor_key(&watch.branch);
        let head = self.branch_head(&watch.branch, cancel).await?;

        let cursor = self.services.cursors.get(&key).await?;
        if cursor.as_deref() == Some(head.commit_id.as_str()) {
            info!(commit = %head.commit_id, "Branch is up to date");
            return Ok(IterationOutcome::UpToDate {
                commit_id: head.commit_id,
            });
        }
        info!(
            commit = %head.commit_id,
            previous = cursor.as_deref().unwrap_or("none"),
            "New commit detected"
        );

        let buffer = self.buffer_dir(&watch.branch);
        let result = async {
            let (tag, files) = self
                .build_commit(watch, &head.commit_id, &buffer, cancel)
                .await?;
            self.services.cursors.set(&key, &head.commit_id).await?;
            info!(commit = %head.commit_id, tag = %tag, "Commit recorded");
            Ok::<_, PipelineError>(IterationOutcome::Built {
                commit_id: head.commit_id.clone(),
                tag,
                files,
            })
        }
        .await;

        remove_buffer(&buffer).await;
        result
    }

    async fn branch_head(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<Branch, PipelineError> {
        let provider = &*self.services.provider;
        let (owner, repo) = (&*self.owner, &*self.repo);
        self.services
            .retry
            .execute(
                cancel,
                move |token| async move {
                    until_cancelled(&token, provider.get_branch(owner, repo, branch), || {
                        ProviderError::Cancelled
                    })
                    .await
                },
                |attempt| warn!(attempt, "Retrying branch lookup"),
            )
            .await
            .map_err(|source| PipelineError::Retry {
                operation: "read branch head",
                source,
            })
    }

    async fn commit_tree(
        &self,
        commit_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TreeEntry>, PipelineError> {
        let provider = &*self.services.provider;
        let (owner, repo) = (&*self.owner, &*self.repo);
        self.services
            .retry
            .execute(
                cancel,
                move |token| async move {
                    until_cancelled(&token, provider.get_tree(owner, repo, commit_id), || {
                        ProviderError::Cancelled
                    })
                    .await
                },
                |attempt| warn!(attempt, "Retrying tree listing"),
            )
            .await
            .map_err(|source| PipelineError::Retry {
                operation: "list tree",
                source,
            })
    }

    /// Download, package and build. Returns the image tag and file count.
    async fn build_commit(
        &self,
        watch: &BranchWatch,
        commit_id: &str,
        buffer: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, usize), PipelineError> {
        // Leftovers from an interrupted run are not ours to build from.
        if tokio::fs::try_exists(buffer).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(buffer)
                .await
                .map_err(PipelineError::io(buffer))?;
        }
        tokio::fs::create_dir_all(buffer)
            .await
            .map_err(PipelineError::io(buffer))?;

        let tree = self.commit_tree(commit_id, cancel).await?;
        let downloader = Downloader {
            provider: Arc::clone(&self.services.provider),
            retry: self.services.retry.clone(),
            owner: Arc::clone(&self.owner),
            repo: Arc::clone(&self.repo),
            max_concurrent: self.services.max_concurrent_downloads,
        };
        let files = downloader.download(tree, buffer, cancel).await?;

        let dockerfile = self.services.names.build_file_name();
        let source = &watch.pipeline.docker_file_path;
        tokio::fs::copy(source, buffer.join(&dockerfile))
            .await
            .map_err(PipelineError::io(source))?;

        let context = BuildContext::from_dir(buffer).await?;
        let tag = self.services.names.image_tag();
        info!(
            tag = %tag,
            files,
            context_bytes = context.len(),
            digest = %context.digest(),
            "Building image"
        );

        let output = self
            .services
            .builder
            .build(BuildRequest {
                context,
                dockerfile,
                tag,
            })
            .await?;
        debug!(
            lines = output.log_lines.len(),
            duration_ms = output.duration_ms,
            "Build output drained"
        );

        if !watch.pipeline.remote_commands.is_empty() {
            debug!(
                commands = watch.pipeline.remote_commands.len(),
                "Remote commands configured, not executed"
            );
        }

        Ok((output.tag, files))
    }
}

async fn remove_buffer(buffer: &Path) {
    match tokio::fs::remove_dir_all(buffer).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %buffer.display(), error = %e, "Failed to remove buffer directory"),
    }
}
