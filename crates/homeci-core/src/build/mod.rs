//! Image builds.
//!
//! The pipeline hands an [`ImageBuilder`] a tar context plus the name of the
//! build file inside it. [`DockerCliBuilder`] drives `docker build` over
//! stdin; tests use the recording doubles in [`crate::fakes`].

mod context;
mod docker;
mod error;

use async_trait::async_trait;

pub use context::{BuildContext, ContextEntry};
pub use docker::DockerCliBuilder;
pub use error::BuildError;

/// One image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Archive consumed by the build.
    pub context: BuildContext,
    /// Build file path relative to the context root.
    pub dockerfile: String,
    /// Tag applied to the resulting image.
    pub tag: String,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub tag: String,
    pub context_digest: String,
    /// Drained builder output, one entry per line.
    pub log_lines: Vec<String>,
    pub duration_ms: u64,
}

/// Builds a container image from a context archive.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BuildError>;
}
