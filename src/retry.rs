//! Manual retry of failed uploads.

use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::task::{TaskId, TaskStatus, UploadTask};

/// Decides whether a failed task may be re-queued and performs the re-queue.
///
/// Retries are only ever triggered by the caller. There is no attempt
/// ceiling here; callers wanting one compare [`UploadTask::retry_count`]
/// before calling [`RetryController::retry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController;

impl RetryController {
    /// Returns true if `task` failed with a retryable error.
    #[must_use]
    pub fn can_retry(task: &UploadTask) -> bool {
        task.status == TaskStatus::Failed
            && task.error.as_ref().is_none_or(|e| e.kind.is_retryable())
    }

    /// Moves a failed task back to `Queued`, bumping its retry count.
    ///
    /// Returns the new retry count. The caller must `tick` the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for unknown ids and
    /// [`Error::NotRetryable`] if the task is not a retryable failure.
    pub fn retry(registry: &mut TaskRegistry, id: &TaskId) -> Result<u32> {
        let task = registry.get(id).ok_or(Error::TaskNotFound(*id))?;
        if !Self::can_retry(task) {
            return Err(Error::NotRetryable {
                id: *id,
                status: task.status,
            });
        }
        registry.transition(id, TaskStatus::Queued)?;
        let mut count = 0;
        registry.update(id, |t| {
            t.retry_count += 1;
            t.error = None;
            t.progress_percent = 0;
            count = t.retry_count;
        })?;
        Ok(count)
    }
}
