// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manager counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::trace;

/// Point-in-time copy of the manager counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Flows added or restored.
    pub started: u64,
    /// Flows that reached a terminal state.
    pub finished: u64,
    /// Checkpoints persisted.
    pub checkpoints_written: u64,
    /// Mean checkpoint writes per second since the manager started.
    pub checkpoint_rate_per_sec: f64,
    /// Flows currently in the registry.
    pub in_flight: u64,
}

#[derive(Debug)]
pub(crate) struct FlowMetrics {
    started: AtomicU64,
    finished: AtomicU64,
    checkpoints_written: AtomicU64,
    since: Instant,
}

impl FlowMetrics {
    pub(crate) fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            since: Instant::now(),
        }
    }

    pub(crate) fn flow_started(&self) {
        let started = self.started.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(counter = "flows.started", value = started);
    }

    pub(crate) fn flow_finished(&self) {
        let finished = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(counter = "flows.finished", value = finished);
    }

    pub(crate) fn checkpoint_written(&self) {
        let written = self.checkpoints_written.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(counter = "flows.checkpoints_written", value = written);
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> MetricsSnapshot {
        let checkpoints_written = self.checkpoints_written.load(Ordering::Relaxed);
        let elapsed = self.since.elapsed().as_secs_f64();
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            checkpoints_written,
            checkpoint_rate_per_sec: if elapsed > 0.0 {
                checkpoints_written as f64 / elapsed
            } else {
                0.0
            },
            in_flight: in_flight as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = FlowMetrics::new();
        metrics.flow_started();
        metrics.flow_started();
        metrics.flow_finished();
        metrics.checkpoint_written();

        let snapshot = metrics.snapshot(1);
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.finished, 1);
        assert_eq!(snapshot.checkpoints_written, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert!(snapshot.checkpoint_rate_per_sec >= 0.0);
    }
}
