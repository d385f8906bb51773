//! Small helpers shared across the stack.

use std::time::Duration;

/// Bounded exponential backoff with a running total.
///
/// Hands out `initial`, then `initial * factor`, and so on up to `cap`.
/// [`BackoffGenerator::total`] is the sum of everything handed out since
/// the last reset, which is what retry budgets are checked against.
#[derive(Debug, Clone)]
pub struct BackoffGenerator {
    initial: Duration,
    factor: f64,
    cap: Duration,
    next: Duration,
    total: Duration,
}

impl BackoffGenerator {
    pub fn new(initial: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            initial,
            factor,
            cap,
            next: initial,
            total: Duration::ZERO,
        }
    }

    /// The next delay to sleep for.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.total += delay;
        self.next = Duration::from_secs_f64(self.next.as_secs_f64() * self.factor).min(self.cap);
        delay
    }

    /// Time handed out since the last reset.
    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.total = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = BackoffGenerator::new(
            Duration::from_millis(500),
            1.5,
            Duration::from_millis(3000),
        );
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(750));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1125));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(3000));
    }

    #[test]
    fn backoff_total_and_reset() {
        let mut backoff = BackoffGenerator::new(
            Duration::from_millis(500),
            1.5,
            Duration::from_millis(3000),
        );
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.total(), Duration::from_millis(1250));
        backoff.reset();
        assert_eq!(backoff.total(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
