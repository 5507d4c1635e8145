//! Upload task model: identifiers, statuses, payloads and results.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable identifier of one upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for admission.
    Queued,
    /// Transfer in flight.
    Uploading,
    /// Stored successfully. Terminal.
    Succeeded,
    /// Transfer failed; may be retried.
    Failed,
    /// Removed by the caller or torn down with the session. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if `next` is a legal successor of this status.
    ///
    /// ```text
    /// Queued    -> Uploading | Cancelled
    /// Uploading -> Succeeded | Failed | Cancelled
    /// Failed    -> Queued    | Cancelled
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Uploading | Self::Cancelled)
                | (Self::Uploading, Self::Succeeded | Self::Failed | Self::Cancelled)
                | (Self::Failed, Self::Queued | Self::Cancelled)
        )
    }

    /// Returns true for statuses no transfer will ever leave on its own.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true for `Queued` and `Uploading`.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Uploading)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classification of why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorKind {
    /// File rejected before admission. Never stored on a task.
    Validation,
    /// Transfer failed in transit.
    Network,
    /// Transfer exceeded the configured timeout.
    Timeout,
    /// Transfer was cancelled by the caller.
    Aborted,
    /// The backend refused the file.
    ServerRejected {
        /// The backend will refuse this file again.
        permanent: bool,
    },
}

impl ErrorKind {
    /// Returns true if retrying the transfer can succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        match self {
            Self::Network | Self::Timeout => true,
            Self::ServerRejected { permanent } => !permanent,
            Self::Validation | Self::Aborted => false,
        }
    }
}

/// Error attached to a `Failed` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable message for display.
    pub message: String,
}

impl TaskError {
    /// Creates a task error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Location of a stored file, returned by the storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Storage path, used later for removal.
    pub path: String,
    /// Public or signed URL of the stored file.
    pub url: String,
    /// Preview URL for images, if the backend produces one.
    pub thumbnail_url: Option<String>,
}

/// Grouping tag identifying which record a file belongs to.
///
/// The session never interprets these values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    /// Owning inspection (or other top-level record).
    pub inspection_id: String,
    /// Checklist item within the inspection, if any.
    pub checklist_item_id: Option<String>,
}

impl OwnerKey {
    /// Creates an owner key for a whole inspection.
    pub fn inspection(inspection_id: impl Into<String>) -> Self {
        Self {
            inspection_id: inspection_id.into(),
            checklist_item_id: None,
        }
    }

    /// Creates an owner key for one checklist item.
    pub fn checklist_item(
        inspection_id: impl Into<String>,
        checklist_item_id: impl Into<String>,
    ) -> Self {
        Self {
            inspection_id: inspection_id.into(),
            checklist_item_id: Some(checklist_item_id.into()),
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.checklist_item_id {
            Some(item) => write!(f, "{}/{item}", self.inspection_id),
            None => f.write_str(&self.inspection_id),
        }
    }
}

/// A file handed to the session for upload.
#[derive(Clone)]
pub struct UploadFile {
    /// Display name, usually the original file name.
    pub name: String,
    /// MIME type reported by the caller.
    pub mime_type: String,
    /// File contents.
    pub data: Bytes,
}

impl UploadFile {
    /// Creates an upload file from in-memory contents.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Reads a file from disk, guessing its MIME type from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let mime_type = mime_from_name(&name).to_string();
        Ok(Self::new(name, mime_type, data))
    }

    /// Size of the contents in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Guesses a MIME type from a file name's extension.
#[must_use]
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// One file's upload lifecycle, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTask {
    /// Stable identifier assigned at enqueue.
    pub id: TaskId,
    /// File name as given by the caller.
    pub name: String,
    /// Size of the file content.
    pub size_bytes: u64,
    /// MIME type as given by the caller.
    pub mime_type: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// 0-100; only meaningful while `Uploading`.
    pub progress_percent: u8,
    /// Number of manual retries so far.
    pub retry_count: u32,
    /// Set only while `Failed`.
    pub error: Option<TaskError>,
    /// Set only once `Succeeded`.
    pub result: Option<StoredObject>,
    /// Grouping tag supplied at enqueue time.
    pub owner: Option<OwnerKey>,
    /// When the task was created.
    pub enqueued_at: DateTime<Utc>,
}

impl UploadTask {
    /// Creates a queued task describing `file`.
    #[must_use]
    pub fn queued(file: &UploadFile, owner: Option<OwnerKey>) -> Self {
        Self {
            id: TaskId::new(),
            name: file.name.clone(),
            size_bytes: file.size_bytes(),
            mime_type: file.mime_type.clone(),
            status: TaskStatus::Queued,
            progress_percent: 0,
            retry_count: 0,
            error: None,
            result: None,
            owner,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Succeeded));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Uploading.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn illegal_transitions() {
        use TaskStatus::*;
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Queued));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ServerRejected { permanent: false }.is_retryable());
        assert!(!ErrorKind::ServerRejected { permanent: true }.is_retryable());
        assert!(!ErrorKind::Aborted.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
    }

    #[test]
    fn queued_task_captures_file_metadata() {
        let file = UploadFile::new("crack.jpg", "image/jpeg", vec![0u8; 42]);
        let task = UploadTask::queued(&file, Some(OwnerKey::checklist_item("insp-1", "item-3")));
        assert_eq!(task.name, "crack.jpg");
        assert_eq!(task.size_bytes, 42);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn owner_key_display() {
        assert_eq!(OwnerKey::inspection("insp-1").to_string(), "insp-1");
        assert_eq!(
            OwnerKey::checklist_item("insp-1", "item-3").to_string(),
            "insp-1/item-3"
        );
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(mime_from_name("photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_name("report.pdf"), "application/pdf");
        assert_eq!(mime_from_name("noext"), "application/octet-stream");
    }

    #[test]
    fn upload_file_debug_omits_contents() {
        let file = UploadFile::new("a.txt", "text/plain", &b"secret"[..]);
        let dbg = format!("{file:?}");
        assert!(dbg.contains("size: 6"));
        assert!(!dbg.contains("secret"));
    }

    #[tokio::test]
    async fn upload_file_from_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("site.png");
        std::fs::write(&path, b"png-bytes").unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "site.png");
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.size_bytes(), 9);
    }
}
