//! Reconnect backoff for the control channel.

use std::time::Duration;

/// Doubling delay between connection attempts, capped at `max`.
///
/// Retries are unlimited; the schedule with the defaults is
/// 5s, 10s, 20s, 40s, 60s, 60s, ...
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Start over from the initial delay (after a healthy connection).
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_to_cap() {
        let mut b = ReconnectBackoff::default();
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut b = ReconnectBackoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn max_below_initial_is_raised() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
    }
}
