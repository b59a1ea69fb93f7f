use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reimplementation of std::time::Duration, but panic-free
/// and partial, only to match our needs:
///   - use micros instead of nanos, avoid casts
///   - expose fields
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Duration {
    pub secs: u32,
    pub micros: u32,
}

pub const MICROS_PER_SEC: u32 = 1_000_000;

impl Duration {
    /// Build Duration from secs and micros
    pub fn new(secs: u32, micros: u32) -> Duration {
        Duration { secs, micros }
    }

    /// Wall-clock time, used for frames without a capture timestamp (idle ticks)
    pub fn now() -> Duration {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Duration::new(d.as_secs() as u32, d.subsec_micros()),
            Err(_) => Duration::default(),
        }
    }

    /// Test if Duration object is null
    #[inline]
    pub fn is_null(self) -> bool {
        self.secs == 0 && self.micros == 0
    }

    /// Total number of microseconds
    #[inline]
    pub fn as_micros(self) -> u64 {
        u64::from(self.secs) * u64::from(MICROS_PER_SEC) + u64::from(self.micros)
    }
}

impl Add for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn add(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_add(other.secs);
        let micros = self.micros.wrapping_add(other.micros);
        let (secs, micros) = if micros >= MICROS_PER_SEC {
            (secs + (micros / MICROS_PER_SEC), micros % MICROS_PER_SEC)
        } else {
            (secs, micros)
        };

        Duration { secs, micros }
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn sub(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_sub(other.secs);
        let (secs, micros) = if self.micros >= other.micros {
            (secs, self.micros - other.micros)
        } else {
            let diff = other.micros.wrapping_sub(self.micros);
            let secs_less = diff / MICROS_PER_SEC;
            let micros = MICROS_PER_SEC - (diff % MICROS_PER_SEC);
            (secs.wrapping_sub(1 + secs_less), micros)
        };

        Duration { secs, micros }
    }
}

#[cfg(test)]
mod tests {
    use super::Duration;
    #[test]
    fn duration_sub() {
        let d1 = Duration::new(1234, 5678);
        let d2 = Duration::new(1234, 6789);
        let d = d2 - d1;
        assert_eq!(d.secs, 0);
        assert_eq!(d.micros, 1111);
    }

    #[test]
    fn duration_sub_borrow() {
        let d = Duration::new(10, 100) - Duration::new(9, 200);
        assert_eq!(d, Duration::new(0, 999_900));
    }

    #[test]
    fn duration_add_carry() {
        let d = Duration::new(1, 600_000) + Duration::new(1, 400_000);
        assert_eq!(d, Duration::new(3, 0));
        assert_eq!(d.as_micros(), 3_000_000);
    }
}
