//! Core counters exposed to an external collector.
//!
//! Plain atomics, relaxed ordering; readers take point-in-time snapshots.
//! Durations are recorded as cumulative micros plus a count so a collector
//! can derive averages without the core carrying histogram state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    acquired: AtomicU64,
    rejected_concurrency: AtomicU64,
    rejected_rate: AtomicU64,
    commits: AtomicU64,
    write_errors: AtomicU64,
    commit_errors: AtomicU64,
    current_limit: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionMetricsSnapshot {
    pub acquired: u64,
    pub rejected_concurrency: u64,
    pub rejected_rate: u64,
    pub commits: u64,
    pub write_errors: u64,
    pub commit_errors: u64,
    pub current_limit: u64,
    pub in_flight: u64,
}

impl AdmissionMetrics {
    pub fn incr_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rejected_concurrency(&self) {
        self.rejected_concurrency.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rejected_rate(&self) {
        self.rejected_rate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_write_errors(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_commit_errors(&self) {
        self.commit_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_limit(&self, limit: u64) {
        self.current_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_in_flight(&self, in_flight: u64) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected_concurrency: self.rejected_concurrency.load(Ordering::Relaxed),
            rejected_rate: self.rejected_rate.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            current_limit: self.current_limit.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct LogMetrics {
    appended_entries: AtomicU64,
    appended_bytes: AtomicU64,
    append_micros: AtomicU64,
    append_samples: AtomicU64,
    segments_rotated: AtomicU64,
    segments_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    pub appended_entries: u64,
    pub appended_bytes: u64,
    pub append_micros: u64,
    pub append_samples: u64,
    pub segments_rotated: u64,
    pub segments_deleted: u64,
}

impl LogMetrics {
    pub fn record_append(&self, entries: u64, bytes: u64, elapsed: Duration) {
        self.appended_entries.fetch_add(entries, Ordering::Relaxed);
        self.appended_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.append_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.append_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_segments_rotated(&self) {
        self.segments_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_segments_deleted(&self, n: u64) {
        self.segments_deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            appended_entries: self.appended_entries.load(Ordering::Relaxed),
            appended_bytes: self.appended_bytes.load(Ordering::Relaxed),
            append_micros: self.append_micros.load(Ordering::Relaxed),
            append_samples: self.append_samples.load(Ordering::Relaxed),
            segments_rotated: self.segments_rotated.load(Ordering::Relaxed),
            segments_deleted: self.segments_deleted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct SnapshotMetrics {
    taken: AtomicU64,
    installed: AtomicU64,
    take_micros: AtomicU64,
    install_micros: AtomicU64,
    retention_deleted: AtomicU64,
    failed_installs: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetricsSnapshot {
    pub taken: u64,
    pub installed: u64,
    pub take_micros: u64,
    pub install_micros: u64,
    pub retention_deleted: u64,
    pub failed_installs: u64,
}

impl SnapshotMetrics {
    pub fn record_take(&self, elapsed: Duration) {
        self.taken.fetch_add(1, Ordering::Relaxed);
        self.take_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_install(&self, elapsed: Duration) {
        self.installed.fetch_add(1, Ordering::Relaxed);
        self.install_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn incr_failed_installs(&self) {
        self.failed_installs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retention_deleted(&self, n: u64) {
        self.retention_deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnapshotMetricsSnapshot {
        SnapshotMetricsSnapshot {
            taken: self.taken.load(Ordering::Relaxed),
            installed: self.installed.load(Ordering::Relaxed),
            take_micros: self.take_micros.load(Ordering::Relaxed),
            install_micros: self.install_micros.load(Ordering::Relaxed),
            retention_deleted: self.retention_deleted.load(Ordering::Relaxed),
            failed_installs: self.failed_installs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    entries_applied: AtomicU64,
    entries_skipped: AtomicU64,
    apply_micros: AtomicU64,
    commands_failed: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceMetricsSnapshot {
    pub entries_applied: u64,
    pub entries_skipped: u64,
    pub apply_micros: u64,
    pub commands_failed: u64,
    pub sessions_opened: u64,
    pub sessions_expired: u64,
}

impl ServiceMetrics {
    pub fn record_apply(&self, elapsed: Duration) {
        self.entries_applied.fetch_add(1, Ordering::Relaxed);
        self.apply_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn incr_skipped(&self) {
        self.entries_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_commands_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_sessions_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sessions_expired(&self, n: u64) {
        self.sessions_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            entries_skipped: self.entries_skipped.load(Ordering::Relaxed),
            apply_micros: self.apply_micros.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactionMetrics {
    runs: AtomicU64,
    forced_runs: AtomicU64,
    compact_micros: AtomicU64,
    suppressed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionMetricsSnapshot {
    pub runs: u64,
    pub forced_runs: u64,
    pub compact_micros: u64,
    pub suppressed: u64,
}

impl CompactionMetrics {
    pub fn record_run(&self, forced: bool, elapsed: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.forced_runs.fetch_add(1, Ordering::Relaxed);
        }
        self.compact_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn incr_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompactionMetricsSnapshot {
        CompactionMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            forced_runs: self.forced_runs.load(Ordering::Relaxed),
            compact_micros: self.compact_micros.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_snapshot_reflects_counters() {
        let metrics = AdmissionMetrics::default();
        metrics.incr_acquired();
        metrics.incr_acquired();
        metrics.incr_rejected_rate();
        metrics.set_current_limit(16);

        let snap = metrics.snapshot();
        assert_eq!(snap.acquired, 2);
        assert_eq!(snap.rejected_rate, 1);
        assert_eq!(snap.rejected_concurrency, 0);
        assert_eq!(snap.current_limit, 16);
    }

    #[test]
    fn log_append_latency_accumulates() {
        let metrics = LogMetrics::default();
        metrics.record_append(3, 120, Duration::from_micros(50));
        metrics.record_append(1, 40, Duration::from_micros(30));

        let snap = metrics.snapshot();
        assert_eq!(snap.appended_entries, 4);
        assert_eq!(snap.appended_bytes, 160);
        assert_eq!(snap.append_micros, 80);
        assert_eq!(snap.append_samples, 2);
    }
}
