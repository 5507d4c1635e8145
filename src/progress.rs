//! Progress reporting from transfers and session-level aggregation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

use crate::session::TransferEvent;
use crate::task::{TaskId, TaskStatus, UploadTask};

/// Handle given to a [`StorageAdapter`](crate::StorageAdapter) to report
/// how far a transfer has got.
///
/// Reports are forwarded to the session's event loop. Out-of-order or
/// repeated reports are dropped, so callers may report from several
/// workers without coordination.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: TaskId,
    attempt: u32,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub(crate) fn new(id: TaskId, attempt: u32, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            id,
            attempt,
            events: Some(events),
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// A reporter that discards every report.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            id: TaskId::new(),
            attempt: 0,
            events: None,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// The task this reporter belongs to.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.id
    }

    /// The attempt this reporter belongs to; reports from an earlier
    /// attempt of a retried task are ignored by the session.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Highest percentage reported so far.
    #[must_use]
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Reports a completion percentage (clamped to 100).
    pub fn report_percent(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.high_water.fetch_max(percent, Ordering::Relaxed);
        if percent <= previous {
            return;
        }
        if let Some(events) = &self.events {
            // Send fails only once the session has shut down.
            let _ = events.send(TransferEvent::Progress {
                id: self.id,
                attempt: self.attempt,
                percent,
            });
        }
    }

    /// Reports progress as bytes sent out of `total`.
    pub fn report_bytes(&self, sent: u64, total: u64) {
        self.report_percent(percent_of(sent, total));
    }
}

fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u128::from(sent.min(total)) * 100 / u128::from(total);
    u8::try_from(pct).unwrap_or(100)
}

/// Reduces per-task progress into one session percentage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Mean progress over the tasks still counted towards completion.
    ///
    /// `Queued` counts as 0 and `Succeeded` as 100; `Failed` and
    /// `Cancelled` tasks are left out of the denominator. Adding a queued
    /// task therefore lowers the result immediately. Returns 0 when no task
    /// counts.
    pub fn total_progress<'a, I>(tasks: I) -> u8
    where
        I: IntoIterator<Item = &'a UploadTask>,
    {
        let (sum, count) = tasks
            .into_iter()
            .filter_map(|t| match t.status {
                TaskStatus::Queued => Some(0u64),
                TaskStatus::Uploading => Some(u64::from(t.progress_percent.min(100))),
                TaskStatus::Succeeded => Some(100),
                TaskStatus::Failed | TaskStatus::Cancelled => None,
            })
            .fold((0u64, 0u64), |(sum, count), p| (sum + p, count + 1));

        if count == 0 {
            0
        } else {
            u8::try_from(sum / count).unwrap_or(100)
        }
    }
}
