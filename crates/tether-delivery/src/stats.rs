//! Per-worker delivery statistics.
//!
//! Lifetime totals plus exponential moving averages (90% history, 10% new
//! sample). Purely informational: nothing in the delivery path reads them.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const HISTORY_WEIGHT: f64 = 0.9;
const SAMPLE_WEIGHT: f64 = 0.1;

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerSnapshot {
    pub success_total: u64,
    pub failure_total: u64,
    pub ignored_total: u64,
    /// Smoothed share of outcomes that were successes.
    pub success_rate: f64,
    /// Smoothed share of outcomes that were failures.
    pub failure_rate: f64,
    /// Smoothed share of outcomes that were drops.
    pub ignored_rate: f64,
    /// Smoothed lateness of attempts relative to their due time, in seconds.
    pub avg_delay_secs: f64,
    /// Smoothed call latency, in seconds.
    pub avg_latency_secs: f64,
}

impl WorkerSnapshot {
    /// Sum the totals and average the smoothed values across workers.
    pub fn combine(snapshots: &[WorkerSnapshot]) -> WorkerSnapshot {
        let mut out = WorkerSnapshot::default();
        if snapshots.is_empty() {
            return out;
        }
        for s in snapshots {
            out.success_total += s.success_total;
            out.failure_total += s.failure_total;
            out.ignored_total += s.ignored_total;
            out.success_rate += s.success_rate;
            out.failure_rate += s.failure_rate;
            out.ignored_rate += s.ignored_rate;
            out.avg_delay_secs += s.avg_delay_secs;
            out.avg_latency_secs += s.avg_latency_secs;
        }
        let n = snapshots.len() as f64;
        out.success_rate /= n;
        out.failure_rate /= n;
        out.ignored_rate /= n;
        out.avg_delay_secs /= n;
        out.avg_latency_secs /= n;
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

fn smooth(prev: f64, sample: f64) -> f64 {
    prev * HISTORY_WEIGHT + sample * SAMPLE_WEIGHT
}

/// Counters owned by a single reporter worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    inner: Mutex<WorkerSnapshot>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, delay: Duration, latency: Duration) {
        self.record(Outcome::Success, Some((delay, latency)));
    }

    pub fn record_failure(&self, delay: Duration, latency: Duration) {
        self.record(Outcome::Failure, Some((delay, latency)));
    }

    pub fn record_ignored(&self) {
        self.record(Outcome::Ignored, None);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: Outcome, timing: Option<(Duration, Duration)>) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Outcome::Success => s.success_total += 1,
            Outcome::Failure => s.failure_total += 1,
            Outcome::Ignored => s.ignored_total += 1,
        }
        let hit = |o: Outcome| if o == outcome { 1.0 } else { 0.0 };
        s.success_rate = smooth(s.success_rate, hit(Outcome::Success));
        s.failure_rate = smooth(s.failure_rate, hit(Outcome::Failure));
        s.ignored_rate = smooth(s.ignored_rate, hit(Outcome::Ignored));

        if let Some((delay, latency)) = timing {
            s.avg_delay_secs = smooth(s.avg_delay_secs, delay.as_secs_f64());
            s.avg_latency_secs = smooth(s.avg_latency_secs, latency.as_secs_f64());
        }
    }
}
