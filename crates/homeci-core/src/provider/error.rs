//! Provider errors.

/// Errors from a single provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(String),

    #[error("{url} returned {status}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid API base URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("tree for commit {commit_id} is truncated")]
    TruncatedTree { commit_id: String },

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err.to_string())
    }
}
