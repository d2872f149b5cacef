use core::ops::{Add, Sub};
use core::time::Duration;

/// A timestamp measured in nanoseconds on one of the two timestamp clocks.
///
/// The core does not read hardware clocks itself; the embedder feeds the
/// current monotonic time into [`crate::Kernel::timestamp_tick`] and the
/// core derives the real-time clock from it by applying a settable offset.
/// A `Timestamp` is therefore just a point on whichever clock it was taken
/// from, with saturating arithmetic so that clock adjustments can never
/// wrap a pending expiration around zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The origin of a clock.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since the clock's origin.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    /// Nanoseconds since the clock's origin.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the duration from `earlier` to `self`, or zero if `earlier`
    /// is in fact later.
    #[must_use]
    pub const fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Applies a signed offset, saturating at the clock's origin and at
    /// the far end of the representable range.
    #[must_use]
    pub const fn offset_by(self, nanos: i64) -> Timestamp {
        if nanos >= 0 {
            Timestamp(self.0.saturating_add(nanos as u64))
        } else {
            Timestamp(self.0.saturating_sub(nanos.unsigned_abs()))
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    #[allow(clippy::cast_possible_truncation)]
    fn sub(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration.as_nanos() as u64))
    }
}

/// How long a blocking operation is willing to wait.
///
/// Relative waits are expressed in ticks against the arming processor's
/// tick counter; absolute waits name a point on one of the timestamp
/// clocks. `Never` blocks until explicitly satisfied (or the object is
/// deleted), which is the common case for well-structured systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait indefinitely.
    Never,

    /// Wait at most this many ticks from now.
    Ticks(u64),

    /// Wait until this point on the monotonic clock.
    Monotonic(Timestamp),

    /// Wait until this point on the real-time clock. A later clock-set
    /// operation can make this point arrive early or late; the watchdog
    /// service re-evaluates pending entries when that happens.
    Realtime(Timestamp),
}

#[cfg(test)]
mod tests {
    use super::Timestamp;
    use core::time::Duration;

    #[test]
    fn saturating_arithmetic() {
        let t = Timestamp::from_nanos(100);
        assert_eq!((t - Duration::from_nanos(200)), Timestamp::ZERO);
        assert_eq!(t.offset_by(-200), Timestamp::ZERO);
        assert_eq!(t.offset_by(50), Timestamp::from_nanos(150));
    }

    #[test]
    fn duration_since_never_goes_negative() {
        let early = Timestamp::from_nanos(10);
        let late = Timestamp::from_nanos(30);
        assert_eq!(late.duration_since(early), Duration::from_nanos(20));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }
}
