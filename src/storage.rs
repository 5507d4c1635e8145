//! Storage backend abstraction and a local-filesystem implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;
use crate::task::{ErrorKind, OwnerKey, StoredObject, TaskError, TaskId, UploadFile};

/// Failures reported by a [`StorageAdapter`].
#[derive(Error, Debug)]
pub enum StorageError {
    /// Transfer failed in transit.
    #[error("network error: {0}")]
    Network(String),

    /// The backend refused the file.
    #[error("rejected by storage: {message}")]
    Rejected {
        /// Reason given by the backend.
        message: String,
        /// The backend will refuse this file again.
        permanent: bool,
    },

    /// The transfer observed its cancellation token.
    #[error("transfer aborted")]
    Aborted,

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Maps the failure onto the task-level error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Io(_) => ErrorKind::Network,
            Self::Rejected { permanent, .. } => ErrorKind::ServerRejected {
                permanent: *permanent,
            },
            Self::Aborted => ErrorKind::Aborted,
        }
    }
}

impl From<StorageError> for TaskError {
    fn from(e: StorageError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Per-transfer context handed to [`StorageAdapter::put`].
#[derive(Debug, Clone)]
pub struct PutMeta {
    /// Task being uploaded.
    pub task_id: TaskId,
    /// Owner the task was enqueued for, if any.
    pub owner: Option<OwnerKey>,
    /// Zero for the first attempt, then the task's retry count.
    pub attempt: u32,
}

/// Performs the actual transfer of files to durable storage.
///
/// Implementations should stop work promptly once `cancel` fires; the
/// session abandons the transfer at that point regardless.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Stores `file`, reporting progress as it goes.
    async fn put(
        &self,
        file: &UploadFile,
        meta: &PutMeta,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<StoredObject, StorageError>;

    /// Deletes a previously stored file.
    async fn remove(&self, path: &str) -> Result<(), StorageError>;
}

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Stores files under a root directory using `tokio::fs`.
///
/// Files land at `<owner>/<digest prefix>-<task id>-<name>`, written to a
/// `.part` file first and renamed into place once complete.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    base_url: String,
    chunk_size: usize,
}

impl LocalStorage {
    /// Creates a store rooted at `root`, with `file://` URLs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self {
            root,
            base_url,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Uses `base_url` as the prefix of returned URLs.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets how many bytes are written between progress reports.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Directory files are stored under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<owner>/<digest prefix>-<task id>-<name>`, unique per task.
    fn relative_path(file: &UploadFile, meta: &PutMeta) -> String {
        let digest = Sha256::digest(&file.data);
        let hex = format!("{digest:x}");
        let name = format!("{}-{}-{}", &hex[..12], meta.task_id, sanitize(&file.name));
        match meta.owner.as_ref() {
            Some(owner) => {
                let mut parts = vec![sanitize(&owner.inspection_id)];
                if let Some(item) = &owner.checklist_item_id {
                    parts.push(sanitize(item));
                }
                parts.push(name);
                parts.join("/")
            }
            None => name,
        }
    }
}

/// A `.part` file that is deleted when dropped unless [`keep`](Self::keep)
/// was called after the final rename. Covers `put` futures dropped mid-write.
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    const fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed partial file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove partial file {}: {e}", self.path.display()),
        }
    }
}

/// Replaces anything outside `[A-Za-z0-9._-]` so names cannot escape the root.
fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    async fn put(
        &self,
        file: &UploadFile,
        meta: &PutMeta,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<StoredObject, StorageError> {
        let rel = Self::relative_path(file, meta);
        let dest = self.root.join(&rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = PartFile::new(PathBuf::from(format!("{}.part", dest.display())));

        let total = file.size_bytes();
        let mut out = tokio::fs::File::create(part.path()).await?;
        let mut sent = 0u64;
        for chunk in file.data.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(StorageError::Aborted);
            }
            out.write_all(chunk).await?;
            sent += chunk.len() as u64;
            progress.report_bytes(sent, total);
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(part.path(), &dest).await?;
        part.keep();
        progress.report_bytes(total, total);

        log::debug!("Stored {} at {}", file.name, dest.display());
        let url = format!("{}/{rel}", self.base_url);
        let thumbnail_url = file
            .mime_type
            .to_ascii_lowercase()
            .starts_with("image/")
            .then(|| url.clone());
        Ok(StoredObject {
            path: rel,
            url,
            thumbnail_url,
        })
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.root.join(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
