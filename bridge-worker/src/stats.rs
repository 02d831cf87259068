use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Process-wide delivery counters, shared by every batch task.
#[derive(Default)]
pub struct ProcessingStatistics {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub retries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Percentage of `total`.
    pub success_rate: f64,
    /// Percentage of `total`.
    pub failure_rate: f64,
}

impl ProcessingStatistics {
    pub fn record_received(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let mut last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_error = Some(error.to_owned());
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let total = self.total.load(Ordering::SeqCst);
        let success = self.success.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        StatisticsSnapshot {
            total,
            success,
            failed,
            retries: self.retries.load(Ordering::SeqCst),
            last_error,
            success_rate: percentage(success, total),
            failure_rate: percentage(failed, total),
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
