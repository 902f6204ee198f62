//! Reconnect backoff schedules.
//!
//! The delay factory is injected through
//! [`EslClientConfig`](crate::client::EslClientConfig) so tests can
//! substitute a zero-delay schedule. The production default is
//! [`fib_delays`].

use std::sync::Arc;
use std::time::Duration;

/// A generator yielding the successive delays of one reconnect episode.
pub type DelayGenerator = Box<dyn FnMut() -> Duration + Send>;

/// Factory producing a fresh [`DelayGenerator`] from `(unit, max)`. A new
/// generator is instantiated for every reconnect episode so the schedule
/// restarts from its first delay.
pub type DelayFactory = Arc<dyn Fn(Duration, Duration) -> DelayGenerator + Send + Sync>;

/// Successive Fibonacci multiples of `unit` (1, 1, 2, 3, 5, ...), clipped to
/// `max` when `max` is positive.
pub fn fib_delays(unit: Duration, max: Duration) -> DelayGenerator {
    let mut a: u32 = 0;
    let mut b: u32 = 1;
    Box::new(move || {
        let next = a.saturating_add(b);
        a = b;
        b = next;
        let delay = unit * a;
        if !max.is_zero() && delay > max {
            max
        } else {
            delay
        }
    })
}

/// The default factory: [`fib_delays`].
pub(crate) fn default_delay_factory() -> DelayFactory {
    Arc::new(fib_delays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fib_delays_yields_fibonacci_seconds() {
        let mut delay = fib_delays(Duration::from_secs(1), Duration::ZERO);
        let seconds: Vec<u64> = (0..7)
            .map(|_| delay().as_secs())
            .collect();
        assert_eq!(seconds, vec![1, 1, 2, 3, 5, 8, 13]);
    }

    #[test]
    fn fib_delays_clips_to_max() {
        let mut delay = fib_delays(Duration::from_secs(1), Duration::from_secs(4));
        let seconds: Vec<u64> = (0..6)
            .map(|_| delay().as_secs())
            .collect();
        assert_eq!(seconds, vec![1, 1, 2, 3, 4, 4]);
    }

    #[test]
    fn fib_delays_zero_max_is_unclipped() {
        let mut delay = fib_delays(Duration::from_millis(10), Duration::ZERO);
        for _ in 0..20 {
            delay();
        }
        assert!(delay() > Duration::from_secs(1));
    }

    #[test]
    fn factory_restarts_the_schedule() {
        let factory = default_delay_factory();
        let mut first = factory(Duration::from_secs(1), Duration::ZERO);
        first();
        first();
        first();
        let mut second = factory(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(second(), Duration::from_secs(1));
    }
}
