//! Cumulative upload statistics for a session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Historical throughput counters.
///
/// These reflect everything the session has ever transferred and are not
/// reduced when tasks are removed or cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    /// Number of transfers that succeeded.
    pub total_succeeded: u64,
    /// Number of transfers that failed (each failed attempt counts).
    pub total_failed: u64,
    /// Total bytes of successfully stored files.
    pub total_bytes: u64,
    /// Running mean of successful transfer durations, in milliseconds.
    pub average_upload_time_ms: f64,
    /// Duration of the most recent successful transfer, in milliseconds.
    pub last_upload_time_ms: Option<u64>,
}

/// Accumulates [`Analytics`] as transfers settle.
#[derive(Debug, Default)]
pub struct AnalyticsCollector {
    analytics: Analytics,
}

impl AnalyticsCollector {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful transfer of `bytes` that took `elapsed`.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_success(&mut self, elapsed: Duration, bytes: u64) {
        // u128 -> u64: saturate at MAX for durations > 584 million years
        let ms: u64 = elapsed.as_millis().try_into().unwrap_or(u64::MAX);
        let a = &mut self.analytics;
        a.total_succeeded += 1;
        a.total_bytes = a.total_bytes.saturating_add(bytes);
        a.last_upload_time_ms = Some(ms);
        a.average_upload_time_ms +=
            (ms as f64 - a.average_upload_time_ms) / a.total_succeeded as f64;
    }

    /// Records a failed transfer attempt.
    pub const fn record_failure(&mut self) {
        self.analytics.total_failed += 1;
    }

    /// Returns a copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> Analytics {
        self.analytics.clone()
    }
}
