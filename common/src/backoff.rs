use std::time::Duration;

/// Exponential backoff schedule: `base * multiplier^attempt`, capped. A
/// successful connection calls [`Backoff::reset`]; a failure calls
/// [`Backoff::next_delay`] to get the wait before the next attempt.
///
/// Deliberately jitter-free — the upstream reconnect schedule is a visible
/// contract (1s, 1.5s, 2.25s, … capped at 30s) rather than an internal
/// tuning knob, so randomizing it would make the schedule unverifiable.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
            attempt: 0,
        }
    }

    /// Default upstream reconnect schedule: 1s base, 1.5x multiplier,
    /// capped at 30s.
    pub fn upstream_default() -> Self {
        Self::new(Duration::from_secs(1), 1.5, Duration::from_secs(30))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, then advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        let millis = (self.base.as_millis() as f64 * factor).round() as u64;
        let delay = Duration::from_millis(millis).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_matches_documented_values() {
        let mut b = Backoff::upstream_default();
        assert_eq!(b.next_delay(), Duration::from_millis(1000));
        assert_eq!(b.next_delay(), Duration::from_millis(1500));
        assert_eq!(b.next_delay(), Duration::from_millis(2250));
    }

    #[test]
    fn schedule_caps_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), 1.5, Duration::from_secs(30));
        for _ in 0..30 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}
