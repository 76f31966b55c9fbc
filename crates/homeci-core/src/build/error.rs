//! Build errors.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("build context: {0}")]
    Context(String),

    #[error("build exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("build timed out after {secs} seconds")]
    TimedOut { secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
