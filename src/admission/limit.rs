//! Adaptive concurrency limit driven by append feedback.
//!
//! The limit rises while commits come back fast and reliably, and backs
//! off multiplicatively when latency or failures climb. Samples are
//! evaluated a window at a time so a single outlier cannot whipsaw the
//! limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_INITIAL_LIMIT: usize = 64;
pub const DEFAULT_MIN_LIMIT: usize = 8;
pub const DEFAULT_MAX_LIMIT: usize = 1024;
pub const DEFAULT_TARGET_RTT: Duration = Duration::from_millis(10);
pub const DEFAULT_SAMPLE_WINDOW: usize = 32;

#[derive(Debug, Clone)]
pub struct AdaptiveLimitOptions {
    /// Limit in effect before any feedback arrives
    pub initial_limit: usize,
    /// Floor the limit never drops below
    pub min_limit: usize,
    /// Ceiling the limit never exceeds
    pub max_limit: usize,
    /// Append round-trip the limiter steers toward
    pub target_rtt: Duration,
    /// Number of samples evaluated per adjustment
    pub sample_window: usize,
}

impl Default for AdaptiveLimitOptions {
    fn default() -> Self {
        Self {
            initial_limit: DEFAULT_INITIAL_LIMIT,
            min_limit: DEFAULT_MIN_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            target_rtt: DEFAULT_TARGET_RTT,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

impl AdaptiveLimitOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_limit == 0
            || self.min_limit > self.max_limit
            || self.initial_limit < self.min_limit
            || self.initial_limit > self.max_limit
        {
            return Err(ConfigError::InvalidConcurrencyBounds {
                min: self.min_limit,
                max: self.max_limit,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    rtt: Duration,
    ok: bool,
}

/// AIMD-style limit over a sliding window of append outcomes.
#[derive(Debug)]
pub struct AdaptiveLimit {
    options: AdaptiveLimitOptions,
    limit: AtomicUsize,
    window: Mutex<Vec<Sample>>,
}

impl AdaptiveLimit {
    pub fn new(options: AdaptiveLimitOptions) -> Self {
        let limit = options.initial_limit;
        Self {
            options,
            limit: AtomicUsize::new(limit),
            window: Mutex::new(Vec::new()),
        }
    }

    /// Limit currently in effect.
    pub fn current(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Feeds one append outcome into the window. Once the window fills,
    /// the limit is re-evaluated and the window starts over.
    pub fn record(&self, rtt: Duration, ok: bool) {
        let samples = {
            let mut window = self.window.lock();
            window.push(Sample { rtt, ok });
            if window.len() < self.options.sample_window {
                return;
            }
            std::mem::take(&mut *window)
        };

        let success_rate =
            samples.iter().filter(|s| s.ok).count() as f64 / samples.len() as f64;
        let avg_rtt = samples.iter().map(|s| s.rtt).sum::<Duration>() / samples.len() as u32;

        let current = self.current();
        let adjusted = self.adjust(current, avg_rtt, success_rate);
        if adjusted != current {
            self.limit.store(adjusted, Ordering::Relaxed);
            debug!(
                "Concurrency limit {} -> {} (avg rtt: {:?}, success: {:.0}%)",
                current,
                adjusted,
                avg_rtt,
                success_rate * 100.0
            );
        }
    }

    fn adjust(&self, current: usize, avg_rtt: Duration, success_rate: f64) -> usize {
        let mut new_limit = current;

        if success_rate < 0.8 {
            new_limit = (new_limit * 3 / 4).max(self.options.min_limit);
        } else if success_rate > 0.95 {
            new_limit = (new_limit * 5 / 4).min(self.options.max_limit);
        }

        let target = self.options.target_rtt;
        if avg_rtt > target * 2 {
            new_limit = (new_limit * 2 / 3).max(self.options.min_limit);
        } else if avg_rtt < target / 2 {
            new_limit = (new_limit * 6 / 5).min(self.options.max_limit);
        }

        new_limit
    }
}
