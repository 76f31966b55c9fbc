//! Build context archives.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::BuildError;

/// Tar archive of a directory, ready to be streamed to the builder.
#[derive(Clone)]
pub struct BuildContext {
    archive: Vec<u8>,
    digest: String,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("len", &self.archive.len())
            .field("digest", &self.digest)
            .finish()
    }
}

/// One member of a [`BuildContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub path: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

impl BuildContext {
    /// Archive `dir` on the blocking pool.
    pub async fn from_dir(dir: &Path) -> Result<Self, BuildError> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::from_dir_blocking(&dir))
            .await
            .map_err(|e| BuildError::Context(format!("archive task failed: {e}")))?
    }

    /// Archive every file and directory under `dir` with paths relative to
    /// it. Sizes, modes and mtimes are kept; symlinks are stored as links.
    pub fn from_dir_blocking(dir: &Path) -> Result<Self, BuildError> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all("", dir)?;
        let archive = builder.into_inner()?;
        Ok(Self::from_bytes(archive))
    }

    pub fn from_bytes(archive: Vec<u8>) -> Self {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&archive)));
        Self { archive, digest }
    }

    /// `sha256:<hex>` of the archive bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.archive
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.archive
    }

    /// List the archive members.
    pub fn entries(&self) -> Result<Vec<ContextEntry>, BuildError> {
        let mut archive = tar::Archive::new(Cursor::new(self.archive.as_slice()));
        let mut out = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let header = entry.header();
            out.push(ContextEntry {
                path: entry.path()?.into_owned(),
                size: header.size()?,
                mode: header.mode()?,
                is_dir: header.entry_type().is_dir(),
            });
        }
        Ok(out)
    }

    /// Read one file member by relative path.
    pub fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, BuildError> {
        use std::io::Read;

        let mut archive = tar::Archive::new(Cursor::new(self.archive.as_slice()));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == path {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(Some(content));
            }
        }
        Ok(None)
    }
}
