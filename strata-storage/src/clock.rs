//! Wall clock used for entry timestamps, expiration and CAS seeding.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since unix epoch, stamped on every leaf entry when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReplTimestamp(pub u32);

/// Source of current time for a slice.
///
/// Expiration times are compared against this clock, so tests can
/// drive expiry deterministically with [`ManualClock`].
pub trait Clock: Send + Sync + 'static {
    /// Returns seconds since unix epoch.
    fn now(&self) -> u32;

    #[inline]
    fn timestamp(&self) -> ReplTimestamp {
        ReplTimestamp(self.now())
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
pub struct ManualClock(AtomicU32);

impl ManualClock {
    #[inline]
    pub fn new(now: u32) -> Self {
        ManualClock(AtomicU32::new(now))
    }

    #[inline]
    pub fn set(&self, now: u32) {
        self.0.store(now, Ordering::Release);
    }

    #[inline]
    pub fn advance(&self, secs: u32) {
        self.0.fetch_add(secs, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Source of CAS tags of one slice.
///
/// Tags are seeded with the start time in the upper half, so tags of a
/// reopened slice do not collide with tags issued before the restart.
pub struct CasGenerator(AtomicU64);

impl CasGenerator {
    #[inline]
    pub fn new(clock: &dyn Clock) -> Self {
        CasGenerator(AtomicU64::new((clock.now() as u64) << 32))
    }

    #[inline]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.timestamp(), ReplTimestamp(100));
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(7);
        assert_eq!(clock.now(), 7);
        assert!(SystemClock.now() > 1_600_000_000);
    }

    #[test]
    fn test_cas_generator() {
        let clock = ManualClock::new(3);
        let cas = CasGenerator::new(&clock);
        let a = cas.next();
        let b = cas.next();
        assert_eq!(a, (3u64 << 32) + 1);
        assert_eq!(b, a + 1);
    }
}
