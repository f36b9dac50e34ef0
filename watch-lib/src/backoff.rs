use rand::Rng;
use std::time::Duration;

/// Delay between conflicting attempts.
///
/// The exponential flavour doubles the ceiling after every conflict and caps
/// it at `max`. The actual delay is uniform in `0..=ceiling` ("full jitter").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Backoff {
        Backoff::Exponential { base, max }
    }

    /// Upper bound of the delay after `conflicts` consecutive conflicts.
    pub fn ceiling(&self, conflicts: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { base, max } => {
                // Keep the shift inside a u32.
                let factor = 1u32 << conflicts.saturating_sub(1).min(31);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// The delay to sleep after `conflicts` consecutive conflicts.
    pub fn delay(&self, conflicts: u32) -> Duration {
        let ceiling = self.ceiling(conflicts);
        if ceiling.is_zero() {
            return ceiling;
        }

        let nanos = rand::thread_rng().gen_range(0..=u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX));
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_waits() {
        for n in 0..10 {
            assert_eq!(Backoff::None.delay(n), Duration::ZERO);
        }
    }

    #[test]
    fn ceiling_doubles_then_caps() {
        let backoff = Backoff::exponential(Duration::from_millis(1), Duration::from_millis(20));

        assert_eq!(backoff.ceiling(1), Duration::from_millis(1));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(2));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(8));
        assert_eq!(backoff.ceiling(5), Duration::from_millis(16));
        assert_eq!(backoff.ceiling(6), Duration::from_millis(20));
        assert_eq!(backoff.ceiling(u32::MAX), Duration::from_millis(20));
    }

    #[test]
    fn delay_stays_under_ceiling() {
        let backoff = Backoff::exponential(Duration::from_millis(3), Duration::from_secs(1));

        for n in 1..12 {
            assert!(backoff.delay(n) <= backoff.ceiling(n));
        }
    }
}
