//! Upload session: the event loop that owns all task state, and the
//! cloneable handle callers use to drive it.
//!
//! Every mutation happens on one spawned task. Caller commands and
//! transfer reports are both delivered to it over channels, so the
//! registry is never touched from two places at once. Transfers themselves
//! run concurrently on their own tasks and only ever talk back through
//! [`TransferEvent`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use evidence_upload::{LocalStorage, Session, UploadConfig, UploadFile};
//!
//! # async fn example() -> evidence_upload::Result<()> {
//! let storage = Arc::new(LocalStorage::new("/var/lib/evidence"));
//! let session = Session::spawn(UploadConfig::default(), storage)?;
//!
//! let file = UploadFile::from_path("crack.jpg").await?;
//! let outcome = session.enqueue(vec![file], None).await?;
//! println!("queued {} files", outcome.accepted.len());
//!
//! let done = session.wait_for(|s| s.is_idle()).await?;
//! println!("{}% complete", done.total_progress);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::analytics::{Analytics, AnalyticsCollector};
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::format::{format_bytes, format_duration};
use crate::progress::{ProgressAggregator, ProgressReporter};
use crate::registry::TaskRegistry;
use crate::retry::RetryController;
use crate::scheduler::AdmissionScheduler;
use crate::storage::{PutMeta, StorageAdapter};
use crate::task::{ErrorKind, OwnerKey, StoredObject, TaskError, TaskId, TaskStatus, UploadFile, UploadTask};
use crate::validation::{FileValidator, Rejection};

const COMMAND_BUFFER: usize = 64;

/// Consistent, read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Increases by one with every published snapshot.
    pub version: u64,
    /// All tasks in arrival order.
    pub tasks: Vec<UploadTask>,
    /// Number of tasks uploading.
    pub active: usize,
    /// Number of tasks waiting for admission.
    pub queued: usize,
    /// True while admissions are paused.
    pub paused: bool,
    /// Aggregate completion percentage, see [`ProgressAggregator`].
    pub total_progress: u8,
    /// Historical counters, unaffected by removals.
    pub analytics: Analytics,
    /// True if any task is `Failed`.
    pub has_failures: bool,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            tasks: Vec::new(),
            active: 0,
            queued: 0,
            paused: false,
            total_progress: 0,
            analytics: Analytics::default(),
            has_failures: false,
        }
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<&UploadTask> {
        self.tasks.iter().find(|t| t.id == *id)
    }

    /// Tasks tagged with `owner`, in arrival order.
    pub fn tasks_for<'a>(&'a self, owner: &'a OwnerKey) -> impl Iterator<Item = &'a UploadTask> {
        self.tasks
            .iter()
            .filter(move |t| t.owner.as_ref() == Some(owner))
    }

    /// Storage paths of every succeeded task, in arrival order.
    #[must_use]
    pub fn succeeded_paths(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter_map(|t| t.result.as_ref().map(|r| r.path.as_str()))
            .collect()
    }

    /// True when nothing is queued or uploading.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0
    }

    /// True when a form depending on these uploads may be submitted.
    #[must_use]
    pub const fn can_submit(&self) -> bool {
        self.is_idle() && !self.has_failures
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueOutcome {
    /// Ids of queued tasks, in input order.
    pub accepted: Vec<TaskId>,
    /// Files refused by validation, in input order.
    pub rejected: Vec<Rejection>,
}

/// Identifies a callback registered with [`SessionHandle::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SnapshotCallback = Box<dyn Fn(&Snapshot) + Send>;

enum Command {
    Enqueue {
        files: Vec<UploadFile>,
        owner: Option<OwnerKey>,
        reply: oneshot::Sender<Result<EnqueueOutcome>>,
    },
    Remove {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Retry {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearAll {
        reply: oneshot::Sender<usize>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        callback: SnapshotCallback,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Reports sent from transfer tasks back into the session loop.
#[derive(Debug)]
pub(crate) enum TransferEvent {
    Progress {
        id: TaskId,
        /// Retry count of the task when the transfer started.
        attempt: u32,
        percent: u8,
    },
    Finished {
        id: TaskId,
        outcome: std::result::Result<StoredObject, TaskError>,
    },
}

/// Entry point for creating upload sessions.
pub struct Session;

impl Session {
    /// Spawns a session event loop on the current tokio runtime.
    ///
    /// The loop runs until [`SessionHandle::shutdown`] is called or every
    /// handle is dropped; either way all pending transfers are cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails
    /// [`UploadConfig::validate`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(config: UploadConfig, adapter: Arc<dyn StorageAdapter>) -> Result<SessionHandle> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty());
        let controller = SessionController::new(config, adapter, command_rx, snapshot_tx);
        tokio::spawn(controller.run());
        Ok(SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }
}

/// Cloneable handle to a running session.
///
/// Every mutating method waits until the session has applied the change
/// and published the resulting snapshot, so [`snapshot`](Self::snapshot)
/// called afterwards reflects it.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Queues files for upload.
    ///
    /// Files failing validation are returned in
    /// [`EnqueueOutcome::rejected`] and never enter the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] without queueing anything if the
    /// configured file limit would be exceeded, or [`Error::SessionClosed`].
    pub async fn enqueue(
        &self,
        files: Vec<UploadFile>,
        owner: Option<OwnerKey>,
    ) -> Result<EnqueueOutcome> {
        self.request(|reply| Command::Enqueue {
            files,
            owner,
            reply,
        })
        .await?
    }

    /// Removes a task, aborting its transfer if it is in flight.
    ///
    /// Returns false if the task was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn remove_task(&self, id: TaskId) -> Result<bool> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Re-queues a failed task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRetryable`] if the task is not a retryable
    /// failure, [`Error::TaskNotFound`] if it does not exist, or
    /// [`Error::SessionClosed`].
    pub async fn retry_task(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Retry { id, reply }).await?
    }

    /// Cancels and removes every task. Analytics are kept.
    ///
    /// Returns how many tasks were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn clear_all(&self) -> Result<usize> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    /// Stops admitting queued tasks; in-flight transfers continue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    /// Resumes admissions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Registers a callback invoked with every published snapshot.
    ///
    /// The callback immediately receives the current snapshot. Callbacks run
    /// on the session loop in publication order, so all subscribers see the
    /// same sequence; they must not block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Snapshot) + Send + 'static,
    {
        let callback: SnapshotCallback = Box::new(callback);
        self.request(|reply| Command::Subscribe { callback, reply })
            .await
    }

    /// Removes a callback. Returns false if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has shut down.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Returns the latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Stream of snapshots, starting with the current one.
    ///
    /// Intermediate snapshots may be skipped if the consumer is slow, but a
    /// snapshot older than one already yielded is never produced.
    #[must_use]
    pub fn snapshots(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Waits until a published snapshot satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session shuts down first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(snapshot.clone())
    }

    /// Tears the session down, cancelling every pending transfer.
    ///
    /// Succeeds if the session was already closed.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    /// True once the session loop has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Owns the registry, scheduler and analytics of one session.
struct SessionController {
    config: UploadConfig,
    adapter: Arc<dyn StorageAdapter>,
    validator: FileValidator,
    registry: TaskRegistry,
    scheduler: AdmissionScheduler,
    analytics: AnalyticsCollector,
    transfers: HashMap<TaskId, CancellationToken>,
    subscribers: Vec<(SubscriptionId, SnapshotCallback)>,
    next_subscription: u64,
    version: u64,
    root_token: CancellationToken,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events_rx: mpsc::UnboundedReceiver<TransferEvent>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl SessionController {
    fn new(
        config: UploadConfig,
        adapter: Arc<dyn StorageAdapter>,
        commands: mpsc::Receiver<Command>,
        snapshot_tx: watch::Sender<Snapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let validator = FileValidator::new(config.accept_pattern.as_deref(), config.max_file_size_bytes);
        Self {
            scheduler: AdmissionScheduler::new(config.max_concurrent_uploads),
            config,
            adapter,
            validator,
            registry: TaskRegistry::new(),
            analytics: AnalyticsCollector::new(),
            transfers: HashMap::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
            version: 0,
            root_token: CancellationToken::new(),
            commands,
            events_tx,
            events_rx,
            snapshot_tx,
        }
    }

    async fn run(mut self) {
        log::debug!(
            "Upload session started (max {} concurrent)",
            self.scheduler.max_concurrent()
        );
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                command = self.commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            self.teardown();
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        log::debug!("Upload session stopped");
    }

    /// Applies one caller command. Returns false once the loop should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue {
                files,
                owner,
                reply,
            } => {
                let _ = reply.send(self.enqueue(files, owner));
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.retry(id));
            }
            Command::ClearAll { reply } => {
                let _ = reply.send(self.clear_all());
            }
            Command::Pause { reply } => {
                if !self.scheduler.is_paused() {
                    log::info!("Upload queue paused");
                    self.scheduler.pause();
                    self.publish();
                }
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                if self.scheduler.is_paused() {
                    log::info!("Upload queue resumed");
                    self.scheduler.resume();
                    self.tick();
                    self.publish();
                }
                let _ = reply.send(());
            }
            Command::Subscribe { callback, reply } => {
                let id = SubscriptionId(self.next_subscription);
                self.next_subscription += 1;
                let current = self.snapshot_tx.borrow().clone();
                callback(&current);
                self.subscribers.push((id, callback));
                let _ = reply.send(id);
            }
            Command::Unsubscribe { id, reply } => {
                let before = self.subscribers.len();
                self.subscribers.retain(|(sid, _)| *sid != id);
                let _ = reply.send(self.subscribers.len() != before);
            }
            Command::Shutdown { reply } => {
                self.commands.close();
                self.teardown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                id,
                attempt,
                percent,
            } => {
                if self
                    .registry
                    .get(&id)
                    .is_some_and(|t| t.retry_count != attempt)
                {
                    log::debug!("Ignoring progress for {id} from attempt {attempt}");
                    return;
                }
                match self
                    .scheduler
                    .record_progress(&mut self.registry, &id, percent)
                {
                    Ok(true) => self.publish(),
                    Ok(false) => {}
                    Err(e) => log::debug!("Ignoring progress for {id}: {e}"),
                }
            }
            TransferEvent::Finished { id, outcome } => {
                let size = self.registry.get(&id).map_or(0, |t| t.size_bytes);
                let name = self
                    .registry
                    .get(&id)
                    .map(|t| t.name.clone())
                    .unwrap_or_default();
                let settled = match outcome {
                    Ok(stored) => self
                        .scheduler
                        .finish_success(&mut self.registry, &id, stored)
                        .map(|elapsed| {
                            log::info!(
                                "Upload complete: {name} ({}) in {}",
                                format_bytes(size),
                                format_duration(elapsed)
                            );
                            self.analytics.record_success(elapsed, size);
                        }),
                    Err(error) => {
                        let message = error.message.clone();
                        self.scheduler
                            .finish_failure(&mut self.registry, &id, error)
                            .map(|_| {
                                log::error!("Upload failed: {name}: {message}");
                                self.analytics.record_failure();
                            })
                    }
                };
                match settled {
                    Ok(()) => {
                        self.transfers.remove(&id);
                        self.tick();
                        self.publish();
                    }
                    Err(e) => log::debug!("Ignoring completion for {id}: {e}"),
                }
            }
        }
    }

    fn enqueue(&mut self, files: Vec<UploadFile>, owner: Option<OwnerKey>) -> Result<EnqueueOutcome> {
        if let Some(max) = self.config.max_files {
            let remaining = max.saturating_sub(self.registry.len());
            if files.len() > remaining {
                log::warn!(
                    "Refusing {} files: limit is {max}, {remaining} remaining",
                    files.len()
                );
                return Err(Error::CapacityExceeded {
                    requested: files.len(),
                    remaining,
                });
            }
        }

        let (valid, rejected) = self.validator.partition(files);
        for r in &rejected {
            log::warn!("Rejected {}: {}", r.name, r.reason);
        }

        let mut accepted = Vec::with_capacity(valid.len());
        for file in valid {
            let task = UploadTask::queued(&file, owner.clone());
            let id = task.id;
            log::debug!("Queued {} ({})", file.name, format_bytes(file.size_bytes()));
            self.registry.add(task, file)?;
            accepted.push(id);
        }

        if !accepted.is_empty() {
            self.tick();
            self.publish();
        }
        Ok(EnqueueOutcome { accepted, rejected })
    }

    fn remove(&mut self, id: TaskId) -> bool {
        let Some(task) = self.registry.get(&id) else {
            return false;
        };
        let status = task.status;
        let stored_path = task.result.as_ref().map(|r| r.path.clone());

        // Abort before freeing the slot so the stale transfer cannot land.
        self.abort_transfer(&id);
        if status != TaskStatus::Succeeded {
            let _ = self.registry.transition(&id, TaskStatus::Cancelled);
        }
        self.registry.remove(&id);
        log::info!("Removed task {id} ({status})");

        if self.config.remove_stored_on_delete
            && let Some(path) = stored_path
        {
            self.remove_stored(path);
        }

        self.tick();
        self.publish();
        true
    }

    fn retry(&mut self, id: TaskId) -> Result<()> {
        let attempt = RetryController::retry(&mut self.registry, &id)?;
        log::info!("Retrying task {id} (attempt {})", attempt + 1);
        self.tick();
        self.publish();
        Ok(())
    }

    fn clear_all(&mut self) -> usize {
        for id in self.scheduler.abort_all() {
            if let Some(token) = self.transfers.remove(&id) {
                token.cancel();
            }
        }
        let removed = self.registry.clear();
        if self.config.remove_stored_on_delete {
            for path in removed.iter().filter_map(|t| t.result.as_ref()).map(|r| r.path.clone()) {
                self.remove_stored(path);
            }
        }
        log::info!("Cleared {} tasks", removed.len());
        self.publish();
        removed.len()
    }

    fn teardown(&mut self) {
        self.root_token.cancel();
        self.scheduler.abort_all();
        self.transfers.clear();
        let pending: Vec<_> = self
            .registry
            .iter()
            .filter(|t| t.status.is_pending())
            .map(|t| t.id)
            .collect();
        for id in &pending {
            let _ = self.registry.transition(id, TaskStatus::Cancelled);
        }
        if !pending.is_empty() {
            log::info!("Session teardown cancelled {} tasks", pending.len());
        }
        self.publish();
    }

    fn abort_transfer(&mut self, id: &TaskId) {
        if let Some(token) = self.transfers.remove(id) {
            token.cancel();
        }
        self.scheduler.abort(id);
    }

    fn remove_stored(&self, path: String) {
        let adapter = Arc::clone(&self.adapter);
        tokio::spawn(async move {
            if let Err(e) = adapter.remove(&path).await {
                log::warn!("Failed to delete stored file {path}: {e}");
            }
        });
    }

    /// Admits as many queued tasks as capacity allows and starts them.
    fn tick(&mut self) {
        for id in self.scheduler.tick(&mut self.registry) {
            self.start_transfer(id);
        }
    }

    fn start_transfer(&mut self, id: TaskId) {
        let (Some(task), Some(file)) = (self.registry.get(&id), self.registry.file(&id)) else {
            return;
        };
        let meta = PutMeta {
            task_id: id,
            owner: task.owner.clone(),
            attempt: task.retry_count,
        };
        log::info!(
            "Upload started: {} ({})",
            file.name,
            format_bytes(file.size_bytes())
        );
        let file = file.clone();
        let token = self.root_token.child_token();
        self.transfers.insert(id, token.clone());

        let adapter = Arc::clone(&self.adapter);
        let events = self.events_tx.clone();
        let progress = ProgressReporter::new(id, meta.attempt, events.clone());
        let timeout = self.config.upload_timeout();

        tokio::spawn(async move {
            let put = adapter.put(&file, &meta, progress, token.clone());
            let outcome = tokio::select! {
                () = token.cancelled() => return,
                result = tokio::time::timeout(timeout, put) => match result {
                    Ok(Ok(stored)) => Ok(stored),
                    Ok(Err(e)) => Err(TaskError::from(e)),
                    Err(_) => {
                        token.cancel();
                        Err(TaskError::new(
                            ErrorKind::Timeout,
                            format!("upload timed out after {}", format_duration(timeout)),
                        ))
                    }
                },
            };
            let _ = events.send(TransferEvent::Finished { id, outcome });
        });
    }

    fn build_snapshot(&self) -> Snapshot {
        let tasks = self.registry.all();
        Snapshot {
            version: self.version,
            active: self.scheduler.active_count(),
            queued: self.registry.count(TaskStatus::Queued),
            paused: self.scheduler.is_paused(),
            total_progress: ProgressAggregator::total_progress(&tasks),
            analytics: self.analytics.snapshot(),
            has_failures: tasks.iter().any(|t| t.status == TaskStatus::Failed),
            tasks,
        }
    }

    /// Publishes a fresh snapshot to callbacks and watchers, in that order.
    fn publish(&mut self) {
        self.version += 1;
        let snapshot = self.build_snapshot();
        for (_, callback) in &self.subscribers {
            callback(&snapshot);
        }
        self.snapshot_tx.send_replace(snapshot);
    }
}
