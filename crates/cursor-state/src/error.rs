//! Error types for cursor-state

use thiserror::Error;

/// Errors that can occur in the cursor persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Write did not return the stored record
    #[error("Cursor write for {key} was not acknowledged")]
    WriteNotAcknowledged { key: String },

    /// Empty key component or commit id
    #[error("Invalid cursor input: {0}")]
    InvalidInput(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}
