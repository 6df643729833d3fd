use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub updates_received: u64,
    pub errors_reported: u64,
    pub notifications_delivered: u64,
    pub delivery_failures: u64,
    pub refreshes_started: u64,
    pub refreshes_completed: u64,
    pub refreshes_timed_out: u64,
    pub refreshes_superseded: u64,
    pub dispatch_failures: u64,
}

/// Lock-free counters shared by the hub and the refresh orchestrator.
#[derive(Debug, Default)]
pub struct HubTelemetry {
    updates_received: AtomicU64,
    errors_reported: AtomicU64,
    notifications_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_completed: AtomicU64,
    refreshes_timed_out: AtomicU64,
    refreshes_superseded: AtomicU64,
    dispatch_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl HubTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_update(&self) {
        bump(&self.updates_received, 1);
    }

    pub fn track_error_report(&self) {
        bump(&self.errors_reported, 1);
    }

    pub fn track_delivery(&self, delivered: usize, failed: usize) {
        bump(&self.notifications_delivered, delivered as u64);
        bump(&self.delivery_failures, failed as u64);
    }

    pub fn track_refresh_started(&self) {
        bump(&self.refreshes_started, 1);
    }

    pub fn track_refresh_completed(&self) {
        bump(&self.refreshes_completed, 1);
    }

    pub fn track_refresh_timed_out(&self) {
        bump(&self.refreshes_timed_out, 1);
    }

    pub fn track_refresh_superseded(&self) {
        bump(&self.refreshes_superseded, 1);
    }

    pub fn track_dispatch_failure(&self) {
        bump(&self.dispatch_failures, 1);
    }

    pub fn get_snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            updates_received: self.updates_received.load(Ordering::Relaxed),
            errors_reported: self.errors_reported.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refreshes_completed: self.refreshes_completed.load(Ordering::Relaxed),
            refreshes_timed_out: self.refreshes_timed_out.load(Ordering::Relaxed),
            refreshes_superseded: self.refreshes_superseded.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}
