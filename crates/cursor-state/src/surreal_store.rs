//! SurrealDB-backed CommitCursorStore implementation
//!
//! Cursors live in the `commit_cursors` table, one record per watched branch.
//! The record id is the storage key (`owner.repo.branch`), so a write is a
//! single upsert and concurrent writes to distinct keys never contend.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::cursor::{CommitCursorStore, CursorKey, StorageResult};
use crate::error::StorageError;

const CURSOR_TABLE: &str = "commit_cursors";
const NAMESPACE: &str = "homeci";
const DATABASE: &str = "main";

const SCHEMA: &str = r#"
    DEFINE TABLE IF NOT EXISTS commit_cursors SCHEMAFULL;
    DEFINE FIELD IF NOT EXISTS owner ON commit_cursors TYPE string;
    DEFINE FIELD IF NOT EXISTS repo ON commit_cursors TYPE string;
    DEFINE FIELD IF NOT EXISTS branch ON commit_cursors TYPE string;
    DEFINE FIELD IF NOT EXISTS commit_id ON commit_cursors TYPE string;
    DEFINE FIELD IF NOT EXISTS updated_at ON commit_cursors TYPE datetime;
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorRecord {
    owner: String,
    repo: String,
    branch: String,
    commit_id: String,
    updated_at: SurrealDatetime,
}

/// SurrealDB-backed implementation of [`CommitCursorStore`].
#[derive(Clone)]
pub struct SurrealCursorStore {
    db: Surreal<Any>,
}

impl SurrealCursorStore {
    /// Open (or create) a durable store in a local SurrealKV directory.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let endpoint = format!("surrealkv://{}", path.display());
        Self::connect(&endpoint).await
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint, select `homeci/main` and apply the schema.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(endpoint).await.map_err(|e| {
            StorageError::Connection(format!("Failed to connect to {endpoint}: {e}"))
        })?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        db.query(SCHEMA)
            .await
            .and_then(|response| response.check())
            .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;

        info!("Cursor store connected");
        Ok(Self { db })
    }
}

#[async_trait]
impl CommitCursorStore for SurrealCursorStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &CursorKey) -> StorageResult<Option<String>> {
        key.validate()?;

        let record: Option<CursorRecord> = self.db.select((CURSOR_TABLE, key.storage_key())).await?;
        Ok(record.map(|r| r.commit_id))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn set(&self, key: &CursorKey, commit_id: &str) -> StorageResult<()> {
        key.validate()?;
        if commit_id.is_empty() {
            return Err(StorageError::InvalidInput("empty commit id".to_string()));
        }

        let record = CursorRecord {
            owner: key.owner.clone(),
            repo: key.repo.clone(),
            branch: key.branch.clone(),
            commit_id: commit_id.to_string(),
            updated_at: SurrealDatetime::from(chrono::Utc::now()),
        };

        let stored: Option<CursorRecord> = self
            .db
            .upsert((CURSOR_TABLE, key.storage_key()))
            .content(record)
            .await?;

        if stored.is_none() {
            return Err(StorageError::WriteNotAcknowledged {
                key: key.storage_key(),
            });
        }

        debug!(commit = %commit_id, "Cursor saved");
        Ok(())
    }
}
