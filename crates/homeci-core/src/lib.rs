//! homeci core library
//!
//! Watches git-hosted repositories, builds a container image whenever a
//! watched branch moves, and records the built commit so unchanged branches
//! are skipped.
//!
//! ## Key Components
//!
//! - `Engine`: runs one watch loop per matched branch, reloads on config change
//! - `Manager`: provider wiring, startup reachability checks, runner creation
//! - `BranchPipelineRunner`: detect, download, build, persist
//! - `RetryExecutor`: timed attempts with growing timeouts around every remote call
//! - `ConfigOrganizer`: YAML config with live reload

pub mod build;
pub mod config;
pub mod engine;
pub mod fakes;
pub mod manager;
pub mod naming;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod telemetry;

pub use build::{
    BuildContext, BuildError, BuildOutput, BuildRequest, DockerCliBuilder, ImageBuilder,
};
pub use config::{
    BranchPipelineConfig, ConfigError, ConfigOrganizer, ConfigSnapshot, ProviderKind,
    RepositoryConfig,
};
pub use engine::{Engine, EngineError, ReloadSummary};
pub use manager::{BuilderSource, Collaborators, Manager, ManagerError, ProviderSource};
pub use naming::{NameSource, RandomNames, SequentialNames};
pub use pipeline::{
    BranchPipelineRunner, BranchWatch, IterationOutcome, PipelineError, PipelineServices,
};
pub use provider::{Branch, GithubProvider, ProviderError, RemoteProvider, TreeEntry};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use telemetry::init_tracing;
