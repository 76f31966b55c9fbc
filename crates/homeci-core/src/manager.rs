//! Repository manager: provider wiring, reachability checks, runner creation.

use std::fmt;
use std::sync::Arc;

use cursor_state::CommitCursorStore;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::build::{DockerCliBuilder, ImageBuilder};
use crate::config::{ConfigSnapshot, CredentialType, ProviderKind, RepositoryConfig};
use crate::naming::{NameSource, RandomNames};
use crate::pipeline::{BranchPipelineRunner, PipelineServices};
use crate::provider::{GithubProvider, ProviderError, RemoteProvider};
use crate::retry::{until_cancelled, RetryError, RetryExecutor};

/// Where the remote provider comes from.
#[derive(Clone)]
pub enum ProviderSource {
    /// Build a GitHub client from each snapshot's credentials.
    Github,
    /// Use this provider for every snapshot.
    Fixed(Arc<dyn RemoteProvider>),
}

/// Where the image builder comes from.
#[derive(Clone)]
pub enum BuilderSource {
    /// `docker build` configured from each snapshot's `build` section.
    DockerCli,
    /// Use this builder for every snapshot.
    Fixed(Arc<dyn ImageBuilder>),
}

/// Long-lived collaborators that outlive configuration reloads.
#[derive(Clone)]
pub struct Collaborators {
    pub cursors: Arc<dyn CommitCursorStore>,
    pub provider: ProviderSource,
    pub builder: BuilderSource,
    pub names: Arc<dyn NameSource>,
}

impl Collaborators {
    /// GitHub, the docker CLI and random names.
    pub fn production(cursors: Arc<dyn CommitCursorStore>) -> Self {
        Self {
            cursors,
            provider: ProviderSource::Github,
            builder: BuilderSource::DockerCli,
            names: Arc::new(RandomNames),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn RemoteProvider>) -> Self {
        self.provider = ProviderSource::Fixed(provider);
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = BuilderSource::Fixed(builder);
        self
    }

    pub fn with_names(mut self, names: Arc<dyn NameSource>) -> Self {
        self.names = names;
        self
    }
}

/// One repository that failed the reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryFailure {
    pub repository: String,
    pub reason: String,
}

impl fmt::Display for RepositoryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.repository, self.reason)
    }
}

fn join_failures(failures: &[RepositoryFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{} repositories unreachable: {}", .0.len(), join_failures(.0))]
    Unreachable(Vec<RepositoryFailure>),

    #[error("repository {repository} uses unsupported provider {provider:?}")]
    UnsupportedProvider {
        repository: String,
        provider: String,
    },

    #[error("provider client: {0}")]
    Provider(#[from] ProviderError),

    #[error("repositories have not been verified")]
    NotVerified,
}

/// Owns one configuration's provider client and verified repository set.
pub struct Manager {
    snapshot: Arc<ConfigSnapshot>,
    services: PipelineServices,
    verified: Option<Vec<Arc<RepositoryConfig>>>,
}

impl Manager {
    pub fn new(
        snapshot: Arc<ConfigSnapshot>,
        collaborators: &Collaborators,
    ) -> Result<Self, ManagerError> {
        let provider: Arc<dyn RemoteProvider> = match &collaborators.provider {
            ProviderSource::Fixed(provider) => Arc::clone(provider),
            ProviderSource::Github => {
                let github = &snapshot.git.github;
                let token = Some(github.token.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .or_else(|| credential_token(&snapshot));
                Arc::new(GithubProvider::with_token(&github.api_url, token)?)
            }
        };
        let builder: Arc<dyn ImageBuilder> = match &collaborators.builder {
            BuilderSource::Fixed(builder) => Arc::clone(builder),
            BuilderSource::DockerCli => Arc::new(DockerCliBuilder::from_settings(&snapshot.build)),
        };

        let services = PipelineServices {
            provider,
            cursors: Arc::clone(&collaborators.cursors),
            builder,
            names: Arc::clone(&collaborators.names),
            retry: RetryExecutor::new(snapshot.retry.policy()),
            buffer_root: snapshot.buffer_directory.clone(),
            poll_interval: snapshot.poll_interval(),
            max_concurrent_downloads: snapshot.max_concurrent_downloads,
        };

        Ok(Self {
            snapshot,
            services,
            verified: None,
        })
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }

    /// Repositories that passed the last [`Self::verify`].
    pub fn verified(&self) -> Option<&[Arc<RepositoryConfig>]> {
        self.verified.as_deref()
    }

    /// Check every GitHub repository concurrently. All failures are
    /// collected into one error; the verified set is only recorded when
    /// every repository is reachable.
    #[instrument(skip_all, fields(repositories = self.snapshot.repositories.len()))]
    pub async fn verify(&mut self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let provider = &*self.services.provider;
        let retry = &self.services.retry;

        let checks = self
            .snapshot
            .repositories
            .iter()
            .filter(|r| {
                let supported = r.provider == ProviderKind::Github;
                if !supported {
                    warn!(
                        repository = %r.full_name(),
                        provider = %r.provider,
                        "Skipping reachability check"
                    );
                }
                supported
            })
            .map(|repository| async move {
                let (owner, repo) = (repository.owner.as_str(), repository.repo.as_str());
                let result = retry
                    .execute(
                        cancel,
                        move |token| async move {
                            until_cancelled(&token, provider.check_access(owner, repo), || {
                                ProviderError::Cancelled
                            })
                            .await
                        },
                        |attempt| {
                            warn!(
                                repository = %repository.full_name(),
                                attempt,
                                "Retrying reachability check"
                            )
                        },
                    )
                    .await;
                (repository, result)
            });

        let failures: Vec<RepositoryFailure> = join_all(checks)
            .await
            .into_iter()
            .filter_map(|(repository, result)| {
                result.err().map(|e: RetryError| RepositoryFailure {
                    repository: repository.full_name(),
                    reason: e.to_string(),
                })
            })
            .collect();

        if !failures.is_empty() {
            for failure in &failures {
                error!(
                    repository = %failure.repository,
                    reason = %failure.reason,
                    "Repository unreachable"
                );
            }
            return Err(ManagerError::Unreachable(failures));
        }

        let verified: Vec<_> = self
            .snapshot
            .repositories
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        info!(count = verified.len(), "Repositories verified");
        self.verified = Some(verified);
        Ok(())
    }

    /// One runner per verified repository.
    pub fn runners(&self) -> Result<Vec<Arc<BranchPipelineRunner>>, ManagerError> {
        let verified = self.verified.as_ref().ok_or(ManagerError::NotVerified)?;
        verified
            .iter()
            .map(|repository| match &repository.provider {
                ProviderKind::Github => Ok(Arc::new(BranchPipelineRunner::new(
                    Arc::clone(repository),
                    self.services.clone(),
                ))),
                ProviderKind::Other(name) => Err(ManagerError::UnsupportedProvider {
                    repository: repository.full_name(),
                    provider: name.clone(),
                }),
            })
            .collect()
    }
}

/// Token from a `credentials` block of type `token`, if present.
fn credential_token(snapshot: &ConfigSnapshot) -> Option<String> {
    let credential = snapshot.credentials.as_ref()?;
    if credential.kind != CredentialType::Token {
        return None;
    }
    match credential.token() {
        Ok(token) => Some(token.token),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed token credential");
            None
        }
    }
}
