//! Cursor-State: Commit Cursor Persistence for homeci
//!
//! This crate remembers, per `(owner, repo, branch)`, the last commit a
//! pipeline built successfully. The pipeline compares a branch head against
//! this cursor to decide whether a rebuild is needed.
//!
//! ## Key Components
//!
//! - `CommitCursorStore`: narrow async key-value interface
//! - `CursorKey`: the `(owner, repo, branch)` triple, joined as `owner.repo.branch`
//! - `SurrealCursorStore`: durable store on a local SurrealKV file
//! - `fakes::MemoryCursorStore`: in-memory store for tests

pub mod cursor;
mod error;
pub mod fakes;
mod surreal_store;

pub use cursor::{CommitCursorStore, CursorKey, StorageResult};
pub use error::StorageError;
pub use surreal_store::SurrealCursorStore;
