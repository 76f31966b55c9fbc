//! Configuration snapshot.
//!
//! A [`ConfigSnapshot`] is parsed once from YAML and then shared read-only
//! (`Arc<ConfigSnapshot>`) by the manager, the runners and the engine.
//! [`ConfigOrganizer`] owns the file, keeps the last-known-good snapshot and
//! notifies listeners after a successful re-parse.

mod credential;
mod error;
mod organizer;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF_FACTOR, MAX_ATTEMPT_TIMEOUT};

pub use credential::{Credential, CredentialType, SshCredential, TokenCredential};
pub use error::ConfigError;
pub use organizer::{ChangeListener, ConfigOrganizer, DEFAULT_CONFIG_PATH};

/// Default GitHub REST endpoint.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const MAX_RETRY_ATTEMPTS: u32 = 50;
const MAX_BACKOFF_FACTOR: f64 = 10.0;

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_concurrent_downloads() -> usize {
    16
}

fn default_github_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// Credentials passed through to collaborators (unused by the pipeline itself).
    #[serde(default)]
    pub credentials: Option<Credential>,

    /// Git hosting provider settings.
    #[serde(default)]
    pub git: GitConfig,

    /// Directory where branch trees are downloaded before a build.
    pub buffer_directory: PathBuf,

    /// Watched repositories, in configuration order.
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// Sleep between two iterations of one branch loop.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Concurrent file fetches allowed within one download burst.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub build: BuildSettings,
}

impl ConfigSnapshot {
    /// Parse and validate a snapshot from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let snapshot: ConfigSnapshot = serde_yaml::from_str(yaml)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Read, parse and validate a snapshot from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("bufferDirectory must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("pollIntervalSecs must be at least 1".into()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentDownloads must be at least 1".into(),
            ));
        }
        self.retry.validate()?;

        for (index, repository) in self.repositories.iter().enumerate() {
            if repository.owner.is_empty() || repository.repo.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repositories[{index}]: owner and repo are required"
                )));
            }
            for (p, pipeline) in repository.branch_pipelines.iter().enumerate() {
                if pipeline.template.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{}: branchPipelines[{p}].template is required",
                        repository.full_name()
                    )));
                }
                if pipeline.docker_file_path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{}: branchPipelines[{p}].dockerFilePath is required",
                        repository.full_name()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Git hosting provider settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub github: GithubConfig,
}

/// GitHub client settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    /// Personal access token; empty means anonymous access.
    #[serde(default)]
    pub token: String,

    /// REST API base URL (GitHub Enterprise or a test server).
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: default_github_api_url(),
        }
    }
}

impl fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubConfig")
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Hosting provider of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderKind {
    Github,
    /// Declared in configuration but not implemented.
    Other(String),
}

impl From<String> for ProviderKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "github" => ProviderKind::Github,
            _ => ProviderKind::Other(value),
        }
    }
}

impl From<ProviderKind> for String {
    fn from(value: ProviderKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Github => f.write_str("github"),
            ProviderKind::Other(name) => f.write_str(name),
        }
    }
}

/// One watched repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub branch_pipelines: Vec<BranchPipelineConfig>,
}

impl RepositoryConfig {
    /// `owner/repo`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Pipeline applied to branches whose name matches `template`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPipelineConfig {
    /// Branch name glob, e.g. `feature/*`.
    pub template: String,

    /// Build file copied into the build context.
    pub docker_file_path: PathBuf,

    /// Commands for a post-build step. Carried, never executed.
    #[serde(default)]
    pub remote_commands: Vec<String>,
}

/// Retry tunables, mapped onto [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_timeout_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_timeout_ms: 1000,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.attempts) {
            return Err(ConfigError::Invalid(format!(
                "retry.attempts must be between 1 and {MAX_RETRY_ATTEMPTS}"
            )));
        }
        let max_timeout_ms = MAX_ATTEMPT_TIMEOUT.as_millis() as u64;
        if !(1..=max_timeout_ms).contains(&self.initial_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "retry.initialTimeoutMs must be between 1 and {max_timeout_ms}"
            )));
        }
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.backoff_factor) {
            return Err(ConfigError::Invalid(format!(
                "retry.backoffFactor must be between 1.0 and {MAX_BACKOFF_FACTOR}"
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            initial_timeout: Duration::from_millis(self.initial_timeout_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

/// Image build tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSettings {
    /// Docker CLI executable.
    pub docker_bin: String,

    /// Build timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            timeout_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
credentials:
  type: ssh
  data:
    user: deploy
    privateKey: "-----BEGIN KEY-----"
git:
  github:
    token: ghp_secret
bufferDirectory: /tmp/homeci
repositories:
  - type: github
    owner: acme
    repo: widgets
    branchPipelines:
      - template: "feature/*"
        dockerFilePath: ./Dockerfile
        remoteCommands:
          - docker compose up -d
      - template: main
        dockerFilePath: ./Dockerfile.main
"#;

    #[test]
    fn parses_full_document() {
        let cfg = ConfigSnapshot::from_yaml_str(FULL).unwrap();
        assert_eq!(cfg.buffer_directory, PathBuf::from("/tmp/homeci"));
        assert_eq!(cfg.git.github.token, "ghp_secret");
        assert_eq!(cfg.git.github.api_url, DEFAULT_GITHUB_API_URL);
        assert_eq!(cfg.repositories.len(), 1);

        let repo = &cfg.repositories[0];
        assert_eq!(repo.provider, ProviderKind::Github);
        assert_eq!(repo.full_name(), "acme/widgets");
        assert_eq!(repo.branch_pipelines.len(), 2);
        assert_eq!(repo.branch_pipelines[0].template, "feature/*");
        assert_eq!(
            repo.branch_pipelines[0].remote_commands,
            vec!["docker compose up -d".to_string()]
        );
        assert!(repo.branch_pipelines[1].remote_commands.is_empty());
    }

    #[test]
    fn defaults_apply_when_tunables_are_absent() {
        let cfg = ConfigSnapshot::from_yaml_str(FULL).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.max_concurrent_downloads, 16);
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert_eq!(cfg.build.docker_bin, "docker");
        assert_eq!(cfg.build.timeout_secs, 0);
    }

    #[test]
    fn tunables_override_defaults() {
        let yaml = r#"
bufferDirectory: /tmp/b
pollIntervalSecs: 30
maxConcurrentDownloads: 4
retry:
  attempts: 3
  initialTimeoutMs: 250
build:
  dockerBin: podman
"#;
        let cfg = ConfigSnapshot::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_downloads, 4);
        let policy = cfg.retry.policy();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.initial_timeout, Duration::from_millis(250));
        assert_eq!(policy.backoff_factor, DEFAULT_BACKOFF_FACTOR);
        assert_eq!(cfg.build.docker_bin, "podman");
    }

    #[test]
    fn unknown_provider_type_is_kept() {
        let yaml = r#"
bufferDirectory: /tmp/b
repositories:
  - type: gitlab
    owner: acme
    repo: widgets
"#;
        let cfg = ConfigSnapshot::from_yaml_str(yaml).unwrap();
        assert_eq!(
            cfg.repositories[0].provider,
            ProviderKind::Other("gitlab".to_string())
        );
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = ConfigSnapshot::from_yaml_str("bufferDirectory: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_buffer_directory_is_rejected() {
        let err = ConfigSnapshot::from_yaml_str("repositories: []").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "bufferDirectory: /b\npollIntervalSecs: 0",
            "bufferDirectory: /b\nmaxConcurrentDownloads: 0",
            "bufferDirectory: /b\nretry:\n  attempts: 0",
            "bufferDirectory: /b\nretry:\n  backoffFactor: 0.5",
            "bufferDirectory: /b\nretry:\n  backoffFactor: 1.0e20",
            "bufferDirectory: /b\nretry:\n  backoffFactor: .nan",
            "bufferDirectory: /b\nretry:\n  attempts: 1000",
            "bufferDirectory: /b\nretry:\n  initialTimeoutMs: 18446744073709551615",
            "bufferDirectory: /b\nrepositories:\n  - type: github\n    owner: ''\n    repo: w",
            concat!(
                "bufferDirectory: /b\nrepositories:\n  - type: github\n    owner: a\n",
                "    repo: w\n    branchPipelines:\n      - template: ''\n",
                "        dockerFilePath: D",
            ),
        ];
        for yaml in cases {
            let err = ConfigSnapshot::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{yaml}: {err}");
        }
    }

    #[test]
    fn retry_bounds_are_inclusive() {
        let yaml = "bufferDirectory: /b\nretry:\n  attempts: 50\n  backoffFactor: 10";
        let cfg = ConfigSnapshot::from_yaml_str(yaml).unwrap();
        let timeouts: Vec<_> = cfg.retry.policy().timeouts().collect();
        assert_eq!(timeouts.len(), 50);
        assert_eq!(timeouts.last(), Some(&MAX_ATTEMPT_TIMEOUT));
    }

    #[test]
    fn debug_output_redacts_token() {
        let cfg = ConfigSnapshot::from_yaml_str(FULL).unwrap();
        let rendered = format!("{:?}", cfg.git);
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ConfigSnapshot::load(Path::new("/nonexistent/homeci.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
