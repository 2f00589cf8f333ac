//! Full-jitter exponential backoff for reconnect loops.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// Each call to [`Backoff::next_delay`] doubles the internal ceiling up to
/// `cap` and returns a uniformly random delay below it, so that a thundering
/// herd of reconnecting watchers spreads out. [`Backoff::reset`] is called
/// once a connection has proven healthy again.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The default policy for cluster-facing streams: base 1 s, cap 60 s.
    pub fn watch() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current;
        self.current = (self.current * 2).min(self.cap);
        let micros = ceiling.as_micros().max(1) as u64;
        Duration::from_micros(rand::rng().random_range(0..=micros))
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
