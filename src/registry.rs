//! Authoritative, insertion-ordered store of a session's upload tasks.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::task::{TaskId, TaskStatus, UploadFile, UploadTask};

struct Entry {
    task: UploadTask,
    file: UploadFile,
}

/// Holds every task of one session, in FIFO arrival order.
///
/// The registry is owned by the session event loop, so `&mut self` access
/// already serializes read-modify-write per task.
#[derive(Default)]
pub struct TaskRegistry {
    entries: IndexMap<TaskId, Entry>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task together with the payload it will upload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTask`] if the id is already registered.
    pub fn add(&mut self, task: UploadTask, file: UploadFile) -> Result<()> {
        if self.entries.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        self.entries.insert(task.id, Entry { task, file });
        Ok(())
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&UploadTask> {
        self.entries.get(id).map(|e| &e.task)
    }

    /// Returns the payload registered for a task.
    #[must_use]
    pub fn file(&self, id: &TaskId) -> Option<&UploadFile> {
        self.entries.get(id).map(|e| &e.file)
    }

    /// Applies `patch` to a task in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task was removed in the meantime.
    pub fn update<F>(&mut self, id: &TaskId, patch: F) -> Result<()>
    where
        F: FnOnce(&mut UploadTask),
    {
        let entry = self.entries.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        patch(&mut entry.task);
        Ok(())
    }

    /// Moves a task to `next`, enforcing the task state machine.
    ///
    /// Returns the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for unknown ids and
    /// [`Error::InvalidTransition`] for illegal status changes.
    pub fn transition(&mut self, id: &TaskId, next: TaskStatus) -> Result<TaskStatus> {
        let entry = self.entries.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        let from = entry.task.status;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: *id,
                from,
                to: next,
            });
        }
        entry.task.status = next;
        Ok(from)
    }

    /// Removes a task, preserving the order of the remaining ones.
    pub fn remove(&mut self, id: &TaskId) -> Option<UploadTask> {
        self.entries.shift_remove(id).map(|e| e.task)
    }

    /// Removes every task, returning them in order.
    pub fn clear(&mut self) -> Vec<UploadTask> {
        self.entries.drain(..).map(|(_, e)| e.task).collect()
    }

    /// Returns a copy of every task in arrival order.
    #[must_use]
    pub fn all(&self) -> Vec<UploadTask> {
        self.iter().cloned().collect()
    }

    /// Iterates tasks in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &UploadTask> {
        self.entries.values().map(|e| &e.task)
    }

    /// Returns the oldest queued task, if any.
    #[must_use]
    pub fn first_queued(&self) -> Option<TaskId> {
        self.iter()
            .find(|t| t.status == TaskStatus::Queued)
            .map(|t| t.id)
    }

    /// Counts tasks in the given status.
    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.iter().filter(|t| t.status == status).count()
    }

    /// Number of tasks held, in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no tasks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> (UploadTask, UploadFile) {
        let file = UploadFile::new(name, "image/jpeg", vec![1u8; 10]);
        (UploadTask::queued(&file, None), file)
    }

    fn registry_with(names: &[&str]) -> (TaskRegistry, Vec<TaskId>) {
        let mut reg = TaskRegistry::new();
        let ids = names
            .iter()
            .map(|n| {
                let (t, f) = task(n);
                let id = t.id;
                reg.add(t, f).unwrap();
                id
            })
            .collect();
        (reg, ids)
    }

    #[test]
    fn preserves_insertion_order() {
        let (reg, ids) = registry_with(&["a", "b", "c"]);
        let order: Vec<_> = reg.all().into_iter().map(|t| t.id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let (mut reg, _) = registry_with(&[]);
        let (t, f) = task("a");
        reg.add(t.clone(), f.clone()).unwrap();
        assert!(matches!(reg.add(t, f), Err(Error::DuplicateTask(_))));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn update_missing_task_reports_not_found() {
        let mut reg = TaskRegistry::new();
        let missing = TaskId::new();
        let err = reg.update(&missing, |t| t.progress_percent = 50).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(id) if id == missing));
    }

    #[test]
    fn update_patches_in_place() {
        let (mut reg, ids) = registry_with(&["a"]);
        reg.update(&ids[0], |t| t.progress_percent = 40).unwrap();
        assert_eq!(reg.get(&ids[0]).unwrap().progress_percent, 40);
    }

    #[test]
    fn transition_enforces_state_machine() {
        let (mut reg, ids) = registry_with(&["a"]);
        let id = ids[0];
        assert!(matches!(
            reg.transition(&id, TaskStatus::Succeeded),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(reg.transition(&id, TaskStatus::Uploading).unwrap(), TaskStatus::Queued);
        assert_eq!(reg.transition(&id, TaskStatus::Succeeded).unwrap(), TaskStatus::Uploading);
        assert!(reg.transition(&id, TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let (mut reg, ids) = registry_with(&["a", "b", "c"]);
        assert!(reg.remove(&ids[1]).is_some());
        assert!(reg.remove(&ids[1]).is_none());
        let order: Vec<_> = reg.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![ids[0], ids[2]]);
        assert!(reg.file(&ids[1]).is_none());
    }

    #[test]
    fn first_queued_is_fifo() {
        let (mut reg, ids) = registry_with(&["a", "b", "c"]);
        assert_eq!(reg.first_queued(), Some(ids[0]));
        reg.transition(&ids[0], TaskStatus::Uploading).unwrap();
        assert_eq!(reg.first_queued(), Some(ids[1]));
        assert_eq!(reg.count(TaskStatus::Queued), 2);
        assert_eq!(reg.count(TaskStatus::Uploading), 1);
    }

    #[test]
    fn clear_empties_registry() {
        let (mut reg, ids) = registry_with(&["a", "b"]);
        let drained = reg.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, ids[0]);
        assert!(reg.is_empty());
    }
}
