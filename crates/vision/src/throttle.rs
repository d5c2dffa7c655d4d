//! Minimum spacing between continuous analysis submissions.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

#[derive(Clone, Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Time left before the next submission is allowed.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Record a submission at `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Sleep until the next submission is allowed.
    ///
    /// Returns `false` if `stop` fired (message or disconnect) while waiting.
    pub fn wait(&self, stop: &Receiver<()>) -> bool {
        let remaining = self.remaining(Instant::now());
        match stop.recv_timeout(remaining) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn first_submission_is_immediate() {
        let throttle = Throttle::new(Duration::from_millis(500));
        assert_eq!(throttle.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn remaining_counts_down_from_last_mark() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        let start = Instant::now();
        throttle.mark(start);
        assert_eq!(
            throttle.remaining(start + Duration::from_millis(200)),
            Duration::from_millis(300)
        );
        assert_eq!(
            throttle.remaining(start + Duration::from_millis(900)),
            Duration::ZERO
        );
    }

    #[test]
    fn wait_aborts_when_stopped() {
        let mut throttle = Throttle::new(Duration::from_secs(30));
        throttle.mark(Instant::now());
        let (tx, rx) = bounded::<()>(0);
        drop(tx);
        let started = Instant::now();
        assert!(!throttle.wait(&rx));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_passes_once_interval_elapsed() {
        let mut throttle = Throttle::new(Duration::from_millis(5));
        throttle.mark(Instant::now());
        let (_tx, rx) = bounded::<()>(0);
        assert!(throttle.wait(&rx));
    }
}
