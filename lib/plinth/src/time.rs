use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs()
}

/// A monotonic deadline. `Instant`-based, so wall-clock jumps do not affect
/// expiry checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    #[inline]
    pub fn after(d: Duration) -> Deadline {
        Deadline(Instant::now() + d)
    }

    #[inline]
    pub fn from_instant(at: Instant) -> Deadline {
        Deadline(at)
    }

    #[inline]
    pub fn expired_at(&self, now: Instant) -> bool {
        now >= self.0
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    /// Time left until expiry at `now`, zero if already expired.
    #[inline]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_advances() {
        assert!(timestamp_secs() > 1_500_000_000);
    }

    #[test]
    fn test_deadline_expiry() {
        let now = Instant::now();
        let d = Deadline::from_instant(now + Duration::from_secs(5));
        assert!(!d.expired_at(now));
        assert!(d.expired_at(now + Duration::from_secs(5)));
        assert_eq!(d.remaining_at(now + Duration::from_secs(10)), Duration::ZERO);
        assert_eq!(d.remaining_at(now), Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_zero_is_immediate() {
        assert!(Deadline::after(Duration::ZERO).expired());
    }
}
