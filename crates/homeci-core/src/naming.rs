//! Generated names for build files and image tags.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique names. Injected so tests can predict them.
pub trait NameSource: Send + Sync {
    /// File name under which the build file is copied into the buffer directory.
    fn build_file_name(&self) -> String;

    /// Image tag passed to the builder.
    fn image_tag(&self) -> String;
}

/// Random names backed by v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNames;

impl NameSource for RandomNames {
    fn build_file_name(&self) -> String {
        format!("Dockerfile.{}", uuid::Uuid::new_v4().simple())
    }

    fn image_tag(&self) -> String {
        format!("homeci/{}", uuid::Uuid::new_v4().simple())
    }
}

/// Deterministic names: `Dockerfile.homeci-1`, `homeci/build-1`, ...
#[derive(Debug, Default)]
pub struct SequentialNames {
    next: AtomicU64,
}

impl SequentialNames {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl NameSource for SequentialNames {
    fn build_file_name(&self) -> String {
        format!("Dockerfile.homeci-{}", self.bump())
    }

    fn image_tag(&self) -> String {
        format!("homeci/build-{}", self.bump())
    }
}
