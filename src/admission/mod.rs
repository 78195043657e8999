//! Admission control for appends.
//!
//! Two limiters compose in front of the writer: an adaptive concurrency
//! limit bounding in-flight appends and a token bucket bounding the
//! externally-originated append rate. Control-plane entry types and
//! internal writes bypass the rate limiter so replication upkeep never
//! starves, but every accepted append holds a concurrency permit until
//! its lease resolves.

mod limit;
mod rate;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use limit::{
    AdaptiveLimit, AdaptiveLimitOptions, DEFAULT_INITIAL_LIMIT, DEFAULT_MAX_LIMIT,
    DEFAULT_MIN_LIMIT, DEFAULT_SAMPLE_WINDOW, DEFAULT_TARGET_RTT,
};

use crate::error::{ConfigError, ErrorHandler, PartitionFaultHandler, Rejection};
use crate::metrics::AdmissionMetrics;
use crate::storage::log::EntryType;
use rate::TokenBucket;

/// Where an append originates. Internal writes are replication and
/// partition upkeep; external writes come from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    External,
    Internal,
}

#[derive(Debug, Clone)]
pub struct AdmissionOptions {
    pub limit: AdaptiveLimitOptions,
    /// Externally-originated appends per second; 0 disables rate limiting
    pub write_rate_limit: u64,
    /// Burst allowance; 0 defaults to one second's worth
    pub write_burst: u64,
    /// Entry types that always pass the rate limiter
    pub rate_exempt_types: Vec<EntryType>,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            limit: AdaptiveLimitOptions::default(),
            write_rate_limit: 0,
            write_burst: 0,
            rate_exempt_types: vec![
                EntryType::Configuration,
                EntryType::Initialize,
                EntryType::OpenSession,
                EntryType::CloseSession,
                EntryType::KeepAlive,
                EntryType::Metadata,
            ],
        }
    }
}

impl AdmissionOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limit.validate()
    }
}

#[derive(Debug)]
struct AdmissionInner {
    options: AdmissionOptions,
    limit: AdaptiveLimit,
    bucket: Mutex<TokenBucket>,
    in_flight: AtomicUsize,
    fault_handler: Option<Arc<PartitionFaultHandler>>,
    metrics: Arc<AdmissionMetrics>,
}

impl AdmissionInner {
    fn release_permit(&self) {
        let before = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.metrics.set_in_flight(before.saturating_sub(1) as u64);
    }

    fn record_outcome(&self, rtt: Duration, ok: bool) {
        self.limit.record(rtt, ok);
        self.metrics.set_current_limit(self.limit.current() as u64);
    }

    fn notify_fault<E: ErrorHandler + Clone>(&self, err: &E, operation: &str) {
        if let Some(handler) = &self.fault_handler {
            handler.handle_void(Err::<(), E>(err.clone()), operation);
        }
    }
}

/// Per-partition admission gate. Cloning shares the limiter state.
#[derive(Clone)]
pub struct AdmissionControl {
    inner: Arc<AdmissionInner>,
}

impl AdmissionControl {
    pub fn new(options: AdmissionOptions, metrics: Arc<AdmissionMetrics>) -> Self {
        Self::with_fault_handler(options, metrics, None)
    }

    pub fn with_fault_handler(
        options: AdmissionOptions,
        metrics: Arc<AdmissionMetrics>,
        fault_handler: Option<Arc<PartitionFaultHandler>>,
    ) -> Self {
        let limit = AdaptiveLimit::new(options.limit.clone());
        let bucket = Mutex::new(TokenBucket::new(
            options.write_rate_limit,
            options.write_burst,
        ));
        metrics.set_current_limit(limit.current() as u64);
        Self {
            inner: Arc::new(AdmissionInner {
                options,
                limit,
                bucket,
                in_flight: AtomicUsize::new(0),
                fault_handler,
                metrics,
            }),
        }
    }

    /// Admits one append covering `entry_types`, or rejects immediately.
    /// Never blocks; saturated callers back off and retry.
    pub fn try_acquire(
        &self,
        origin: WriteOrigin,
        entry_types: &[EntryType],
    ) -> Result<InFlightAppend, Rejection> {
        let limit = self.inner.limit.current();
        let mut current = self.inner.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= limit {
                self.inner.metrics.incr_rejected_concurrency();
                return Err(Rejection::ConcurrencyLimitExhausted {
                    in_flight: current,
                    limit,
                });
            }
            match self.inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if origin == WriteOrigin::External {
            let tokens = entry_types
                .iter()
                .filter(|t| !self.inner.options.rate_exempt_types.contains(t))
                .count() as u64;
            if tokens > 0 && !self.inner.bucket.lock().try_take(tokens) {
                self.inner.release_permit();
                self.inner.metrics.incr_rejected_rate();
                return Err(Rejection::WriteRateLimitExhausted);
            }
        }

        self.inner.metrics.incr_acquired();
        self.inner
            .metrics
            .set_in_flight(self.inner.in_flight.load(Ordering::Relaxed) as u64);

        Ok(InFlightAppend {
            inner: self.inner.clone(),
            acquired_at: Instant::now(),
            resolved: false,
        })
    }

    /// Limit currently in effect. Together with [`in_flight`] this lets
    /// the snapshot scheduler defer work under write pressure.
    ///
    /// [`in_flight`]: AdmissionControl::in_flight
    pub fn current_limit(&self) -> usize {
        self.inner.limit.current()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Arc<AdmissionMetrics> {
        self.inner.metrics.clone()
    }
}

/// A granted append slot. Exactly one of [`on_commit`],
/// [`on_write_error`] or [`on_commit_error`] consumes the lease; the
/// permit is returned when the lease drops either way.
///
/// [`on_commit`]: InFlightAppend::on_commit
/// [`on_write_error`]: InFlightAppend::on_write_error
/// [`on_commit_error`]: InFlightAppend::on_commit_error
#[must_use = "an in-flight append must be resolved via on_commit or an error callback"]
#[derive(Debug)]
pub struct InFlightAppend {
    inner: Arc<AdmissionInner>,
    acquired_at: Instant,
    resolved: bool,
}

impl InFlightAppend {
    /// The append committed; feeds a successful round-trip sample.
    pub fn on_commit(mut self, index: u64) {
        let rtt = self.acquired_at.elapsed();
        self.inner.record_outcome(rtt, true);
        self.inner.metrics.incr_commits();
        self.resolved = true;
        debug!("Append committed at index {} (rtt: {:?})", index, rtt);
    }

    /// The write itself failed before reaching the log.
    pub fn on_write_error<E: ErrorHandler + Clone>(mut self, err: &E) {
        let rtt = self.acquired_at.elapsed();
        self.inner.record_outcome(rtt, false);
        self.inner.metrics.incr_write_errors();
        self.inner.notify_fault(err, "append_write");
        self.resolved = true;
    }

    /// The write landed but the commit failed.
    pub fn on_commit_error<E: ErrorHandler + Clone>(mut self, index: u64, err: &E) {
        let rtt = self.acquired_at.elapsed();
        self.inner.record_outcome(rtt, false);
        self.inner.metrics.incr_commit_errors();
        self.inner.notify_fault(err, "append_commit");
        self.resolved = true;
        warn!("Commit failed at index {}: {}", index, err.context());
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for InFlightAppend {
    fn drop(&mut self) {
        if !self.resolved {
            // An abandoned lease still counts against the limiter as a
            // failure so a leaky caller cannot inflate the limit.
            self.inner.record_outcome(self.acquired_at.elapsed(), false);
            warn!("In-flight append dropped without resolution");
        }
        self.inner.release_permit();
    }
}

#[cfg(test)]
mod admission_tests {
    use super::*;
    use crate::error::StorageError;

    fn fixed_limit_options(limit: usize) -> AdmissionOptions {
        AdmissionOptions {
            limit: AdaptiveLimitOptions {
                initial_limit: limit,
                min_limit: limit,
                max_limit: limit,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn new_control(options: AdmissionOptions) -> AdmissionControl {
        AdmissionControl::new(options, Arc::new(AdmissionMetrics::default()))
    }

    #[test]
    fn test_saturation_rejects_then_recovers() {
        let control = new_control(fixed_limit_options(2));

        let first = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        let second = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();

        let err = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap_err();
        assert!(matches!(
            err,
            Rejection::ConcurrencyLimitExhausted {
                in_flight: 2,
                limit: 2
            }
        ));

        first.on_commit(1);
        let third = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();

        second.on_commit(2);
        third.on_commit(3);
        assert_eq!(control.in_flight(), 0);
    }

    #[test]
    fn test_rate_limit_rejects_external_commands() {
        let options = AdmissionOptions {
            write_rate_limit: 2,
            write_burst: 2,
            ..fixed_limit_options(16)
        };
        let control = new_control(options);

        let a = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        let b = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();

        let err = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap_err();
        assert_eq!(err, Rejection::WriteRateLimitExhausted);

        // A rate rejection returns its concurrency permit
        assert_eq!(control.in_flight(), 2);

        a.on_commit(1);
        b.on_commit(2);
    }

    #[test]
    fn test_internal_and_exempt_writes_bypass_rate_limit() {
        let options = AdmissionOptions {
            write_rate_limit: 1,
            write_burst: 1,
            ..fixed_limit_options(16)
        };
        let control = new_control(options);

        let drained = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        assert!(
            control
                .try_acquire(WriteOrigin::External, &[EntryType::Command])
                .is_err()
        );

        // Internal origin skips the bucket entirely
        let internal = control
            .try_acquire(WriteOrigin::Internal, &[EntryType::Command])
            .unwrap();
        // Control-plane types pass even when external
        let keep_alive = control
            .try_acquire(WriteOrigin::External, &[EntryType::KeepAlive])
            .unwrap();

        drained.on_commit(1);
        internal.on_commit(2);
        keep_alive.on_commit(3);
    }

    #[test]
    fn test_mixed_batch_charges_only_rated_types() {
        let options = AdmissionOptions {
            write_rate_limit: 1,
            write_burst: 1,
            ..fixed_limit_options(16)
        };
        let control = new_control(options);

        // One Command + one KeepAlive costs a single token
        let lease = control
            .try_acquire(
                WriteOrigin::External,
                &[EntryType::Command, EntryType::KeepAlive],
            )
            .unwrap();
        assert!(
            control
                .try_acquire(WriteOrigin::External, &[EntryType::Command])
                .is_err()
        );
        lease.on_commit(1);
    }

    #[test]
    fn test_dropped_lease_releases_permit() {
        let control = new_control(fixed_limit_options(1));

        let lease = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        assert!(
            control
                .try_acquire(WriteOrigin::External, &[EntryType::Command])
                .is_err()
        );

        drop(lease);
        let next = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        next.on_commit(1);
    }

    #[test]
    fn test_error_callbacks_count_in_metrics() {
        let metrics = Arc::new(AdmissionMetrics::default());
        let control =
            AdmissionControl::new(fixed_limit_options(4), metrics.clone());

        let lease = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        lease.on_write_error(&StorageError::Closed);

        let lease = control
            .try_acquire(WriteOrigin::External, &[EntryType::Command])
            .unwrap();
        lease.on_commit_error(5, &StorageError::Closed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquired, 2);
        assert_eq!(snapshot.write_errors, 1);
        assert_eq!(snapshot.commit_errors, 1);
        assert_eq!(snapshot.in_flight, 0);
    }
}
