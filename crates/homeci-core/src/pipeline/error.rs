//! Pipeline errors.

use std::io;
use std::path::PathBuf;

use cursor_state::StorageError;

use crate::build::BuildError;
use crate::provider::ProviderError;
use crate::retry::RetryError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid branch template {template:?}: {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("{operation} failed: {source}")]
    Retry {
        operation: &'static str,
        #[source]
        source: RetryError,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("cursor store error: {0}")]
    Storage(#[from] StorageError),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tree entry {path:?} escapes the buffer directory")]
    PathEscapesBuffer { path: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("download task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| PipelineError::Io { path, source }
    }

    /// True when the error only reports that the work was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Provider(ProviderError::Cancelled)
                | PipelineError::Retry {
                    source: RetryError::Cancelled,
                    ..
                }
        )
    }
}
