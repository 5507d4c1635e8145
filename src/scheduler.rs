//! Admission control: keeps at most `max_concurrent` tasks uploading.
//!
//! The scheduler only changes task state; starting and aborting the actual
//! transfers is left to the session, which acts on the ids returned here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::task::{StoredObject, TaskError, TaskId, TaskStatus};

/// Drives tasks from `Queued` to a settled status under a concurrency cap.
#[derive(Debug)]
pub struct AdmissionScheduler {
    max_concurrent: usize,
    paused: bool,
    /// Admitted tasks and when their transfer started.
    active: HashMap<TaskId, Instant>,
}

impl AdmissionScheduler {
    /// Creates a scheduler admitting at most `max_concurrent` transfers.
    ///
    /// A cap of zero is raised to one so queued tasks can always progress.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            paused: false,
            active: HashMap::new(),
        }
    }

    /// Concurrency cap in effect.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of tasks currently admitted.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// True if the task currently holds a slot.
    #[must_use]
    pub fn is_active(&self, id: &TaskId) -> bool {
        self.active.contains_key(id)
    }

    /// True while admissions are paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stops admitting queued tasks. In-flight transfers are left running.
    pub const fn pause(&mut self) {
        self.paused = true;
    }

    /// Allows admissions again. The caller must `tick` afterwards.
    pub const fn resume(&mut self) {
        self.paused = false;
    }

    /// Admits queued tasks in FIFO order while capacity remains.
    ///
    /// Each returned task has been marked `Uploading`; the caller starts one
    /// transfer per id.
    pub fn tick(&mut self, registry: &mut TaskRegistry) -> Vec<TaskId> {
        let mut admitted = Vec::new();
        while !self.paused && self.active.len() < self.max_concurrent {
            let Some(id) = registry.first_queued() else {
                break;
            };
            if let Err(e) = registry.transition(&id, TaskStatus::Uploading) {
                log::error!("Admission of {id} failed: {e}");
                break;
            }
            let _ = registry.update(&id, |t| t.progress_percent = 0);
            self.active.insert(id, Instant::now());
            admitted.push(id);
        }
        admitted
    }

    /// Records a progress report for an in-flight task.
    ///
    /// Progress never regresses. Returns true if the stored value changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task is no longer in flight.
    pub fn record_progress(
        &self,
        registry: &mut TaskRegistry,
        id: &TaskId,
        percent: u8,
    ) -> Result<bool> {
        if !self.is_active(id) {
            return Err(Error::TaskNotFound(*id));
        }
        let percent = percent.min(100);
        let mut changed = false;
        registry.update(id, |t| {
            if percent > t.progress_percent {
                t.progress_percent = percent;
                changed = true;
            }
        })?;
        Ok(changed)
    }

    /// Marks an in-flight task `Succeeded` and frees its slot.
    ///
    /// Returns how long the transfer took.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task is no longer in flight,
    /// e.g. it was removed while its completion was on the way.
    pub fn finish_success(
        &mut self,
        registry: &mut TaskRegistry,
        id: &TaskId,
        stored: StoredObject,
    ) -> Result<Duration> {
        let started = self.release(registry, id, TaskStatus::Succeeded)?;
        registry.update(id, |t| {
            t.progress_percent = 100;
            t.error = None;
            t.result = Some(stored);
        })?;
        Ok(started.elapsed())
    }

    /// Marks an in-flight task `Failed` and frees its slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task is no longer in flight.
    pub fn finish_failure(
        &mut self,
        registry: &mut TaskRegistry,
        id: &TaskId,
        error: TaskError,
    ) -> Result<Duration> {
        let started = self.release(registry, id, TaskStatus::Failed)?;
        registry.update(id, |t| {
            t.error = Some(error);
            t.result = None;
        })?;
        Ok(started.elapsed())
    }

    /// Frees the slot of an aborted task without touching the registry.
    ///
    /// Returns true if the task was in flight.
    pub fn abort(&mut self, id: &TaskId) -> bool {
        self.active.remove(id).is_some()
    }

    /// Frees every slot, returning the ids that were in flight.
    pub fn abort_all(&mut self) -> Vec<TaskId> {
        self.active.drain().map(|(id, _)| id).collect()
    }

    fn release(
        &mut self,
        registry: &mut TaskRegistry,
        id: &TaskId,
        status: TaskStatus,
    ) -> Result<Instant> {
        let started = *self.active.get(id).ok_or(Error::TaskNotFound(*id))?;
        registry.transition(id, status)?;
        self.active.remove(id);
        Ok(started)
    }
}
