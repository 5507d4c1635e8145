//! evidence-upload - Concurrency-capped upload sessions for file attachments.
//!
//! A session moves many files to durable storage through a pluggable
//! [`StorageAdapter`], keeping at most `max_concurrent_uploads` transfers
//! in flight, supporting pause/resume, manual retry and removal, and
//! publishing consistent [`Snapshot`]s to any number of observers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use evidence_upload::{LocalStorage, OwnerKey, Session, UploadConfig, UploadFile};
//!
//! # async fn example() -> evidence_upload::Result<()> {
//! let config = UploadConfig::new()
//!     .with_max_concurrent_uploads(3)
//!     .with_max_files(Some(15))
//!     .with_accept_pattern("image/*,.pdf");
//! let session = Session::spawn(config, Arc::new(LocalStorage::new("./evidence")))?;
//!
//! session
//!     .subscribe(|snapshot| println!("{}% uploaded", snapshot.total_progress))
//!     .await?;
//!
//! let owner = OwnerKey::checklist_item("inspection-42", "item-7");
//! let files = vec![UploadFile::from_path("slab-crack.jpg").await?];
//! let outcome = session.enqueue(files, Some(owner)).await?;
//! for rejected in &outcome.rejected {
//!     eprintln!("{}: {}", rejected.name, rejected.reason);
//! }
//!
//! let done = session.wait_for(|s| s.is_idle()).await?;
//! if done.has_failures {
//!     for task in done.tasks.iter().filter(|t| t.error.is_some()) {
//!         session.retry_task(task.id).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod analytics;
pub mod config;
pub mod error;
pub mod format;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod task;
pub mod validation;

// Re-export main types for convenience
pub use analytics::{Analytics, AnalyticsCollector};
pub use config::UploadConfig;
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration, format_millis};
pub use pool::SessionPool;
pub use progress::{ProgressAggregator, ProgressReporter};
pub use registry::TaskRegistry;
pub use retry::RetryController;
pub use scheduler::AdmissionScheduler;
pub use session::{EnqueueOutcome, Session, SessionHandle, Snapshot, SubscriptionId};
pub use storage::{LocalStorage, PutMeta, StorageAdapter, StorageError};
pub use task::{
    ErrorKind, OwnerKey, StoredObject, TaskError, TaskId, TaskStatus, UploadFile, UploadTask,
};
pub use validation::{AcceptPattern, FileValidator, RejectReason, Rejection};
