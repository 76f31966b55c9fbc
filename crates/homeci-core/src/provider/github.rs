//! GitHub REST v3 provider.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::{Client, Url};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use tracing::debug;

use super::{Branch, BranchPage, EntryKind, ProviderError, RemoteProvider, TreeEntry};
use crate::config::GithubConfig;

const API_VERSION: &str = "2022-11-28";

/// GitHub provider backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct GithubProvider {
    http_client: Client,
    api_url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for GithubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubProvider")
            .field("api_url", &self.api_url())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl GithubProvider {
    /// Build a client from the `git.github` section. An empty token means
    /// anonymous access.
    pub fn new(config: &GithubConfig) -> Result<Self, ProviderError> {
        let token = Some(config.token.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Self::with_token(&config.api_url, token)
    }

    pub fn with_token(api_url: &str, token: Option<String>) -> Result<Self, ProviderError> {
        let invalid = |reason: String| ProviderError::InvalidUrl {
            url: api_url.to_string(),
            reason,
        };
        let parsed = Url::parse(api_url.trim_end_matches('/')).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("cannot be a base URL".to_string()));
        }

        let http_client = Client::builder()
            .user_agent(concat!("homeci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http_client,
            api_url: parsed,
            token,
        })
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_str().trim_end_matches('/')
    }

    /// API URL with `segments` appended, each percent-encoded as one path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::InvalidUrl {
                url: self.api_url.to_string(),
                reason: "cannot be a base URL".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<(T, HeaderMap), ProviderError> {
        let url = self.endpoint(segments)?;
        let mut request = self
            .http_client
            .get(url.clone())
            .query(query)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(url = %url, "GitHub request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }

        let headers = response.headers().clone();
        let body = response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(format!("{url}: {e}")))?;
        Ok((body, headers))
    }
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct BranchBody {
    name: String,
    commit: CommitRef,
    #[serde(default)]
    protected: bool,
}

impl From<BranchBody> for Branch {
    fn from(body: BranchBody) -> Self {
        Branch {
            name: body.name,
            commit_id: body.commit.sha,
            protected: body.protected,
        }
    }
}

#[derive(Deserialize)]
struct TreeBody {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Deserialize)]
struct BlobBody {
    content: String,
    encoding: String,
}

/// Extract the `page` query parameter of the `rel="next"` link, if any.
pub fn next_page_from_link(header: &str) -> Option<u32> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        if !is_next {
            return None;
        }
        let url = Url::parse(target.trim_start_matches('<').trim_end_matches('>')).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}

fn decode_blob(blob: BlobBody) -> Result<Vec<u8>, ProviderError> {
    match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob.content.split_whitespace().collect();
            STANDARD
                .decode(compact)
                .map_err(|e| ProviderError::Decode(format!("blob content: {e}")))
        }
        "utf-8" | "utf8" => Ok(blob.content.into_bytes()),
        other => Err(ProviderError::Decode(format!(
            "unsupported blob encoding: {other}"
        ))),
    }
}

#[async_trait]
impl RemoteProvider for GithubProvider {
    async fn check_access(&self, owner: &str, repo: &str) -> Result<(), ProviderError> {
        let _: (IgnoredAny, _) = self
            .get_json(&["repos", owner, repo], &[])
            .await?;
        Ok(())
    }

    async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<BranchPage, ProviderError> {
        let (body, headers): (Vec<BranchBody>, _) = self
            .get_json(
                &["repos", owner, repo, "branches"],
                &[
                    ("protected", "false".to_string()),
                    ("per_page", per_page.to_string()),
                    ("page", page.to_string()),
                ],
            )
            .await?;

        let next_page = headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_from_link);

        Ok(BranchPage {
            branches: body.into_iter().map(Branch::from).collect(),
            next_page,
        })
    }

    async fn get_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Branch, ProviderError> {
        let (body, _): (BranchBody, _) = self
            .get_json(&["repos", owner, repo, "branches", branch], &[])
            .await?;
        Ok(body.into())
    }

    async fn get_tree(
        &self,
        owner: &str,
        repo: &str,
        commit_id: &str,
    ) -> Result<Vec<TreeEntry>, ProviderError> {
        let (body, _): (TreeBody, _) = self
            .get_json(
                &["repos", owner, repo, "git", "trees", commit_id],
                &[("recursive", "1".to_string())],
            )
            .await?;

        if body.truncated {
            return Err(ProviderError::TruncatedTree {
                commit_id: commit_id.to_string(),
            });
        }

        Ok(body
            .tree
            .into_iter()
            .map(|item| TreeEntry {
                kind: if item.kind == "blob" {
                    EntryKind::File
                } else {
                    EntryKind::Other
                },
                path: item.path,
                object_id: item.sha,
                mode: item.mode,
            })
            .collect())
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        entry: &TreeEntry,
    ) -> Result<Vec<u8>, ProviderError> {
        let (blob, _): (BlobBody, _) = self
            .get_json(
                &["repos", owner, repo, "git", "blobs", entry.object_id.as_str()],
                &[],
            )
            .await?;
        decode_blob(blob)
    }
}
