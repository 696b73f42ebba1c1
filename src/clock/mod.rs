use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Clock speeds are expressed per this many seconds.
pub const SECONDS_PER_CLOCK_UNIT: i64 = 1024;

/// Format accepted by [`TimeStamp::from_date`], interpreted as UTC.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Errors produced while building timestamps from external input.
#[derive(Error, Debug)]
pub enum ClockError {
    #[error("clock speed must be > 0")]
    ZeroClockSpeed,

    #[error("invalid date {input:?} (expected \"YYYY-MM-DD HH:MM:SS\")")]
    InvalidDate {
        input: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// A position on the sample axis.
#[derive(Clone, Copy, Debug)]
pub struct TimeStamp {
    time: i64,
    clock_speed: u32,
}

impl TimeStamp {
    pub const fn new(time: i64, clock_speed: u32) -> Self {
        Self { time, clock_speed }
    }

    /// The largest representable timestamp, used as "+infinity" on shutdown.
    pub const fn max(clock_speed: u32) -> Self {
        Self::new(i64::MAX, clock_speed)
    }

    /// The smallest representable timestamp.
    pub const fn min(clock_speed: u32) -> Self {
        Self::new(i64::MIN, clock_speed)
    }

    /// Current wall-clock time on this clock.
    pub fn now(clock_speed: u32) -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Self::from_unix_nanos(since_epoch.as_nanos() as i128, clock_speed)
    }

    /// Parse a UTC date in [`DATE_FORMAT`].
    pub fn from_date(input: &str, clock_speed: u32) -> Result<Self, ClockError> {
        if clock_speed == 0 {
            return Err(ClockError::ZeroClockSpeed);
        }

        let parsed = NaiveDateTime::parse_from_str(input.trim(), DATE_FORMAT).map_err(|source| {
            ClockError::InvalidDate {
                input: input.to_string(),
                source,
            }
        })?;

        let secs = parsed.and_utc().timestamp() as i128;

        Ok(Self::from_unix_nanos(secs * NANOS_PER_SECOND, clock_speed))
    }

    fn from_unix_nanos(nanos: i128, clock_speed: u32) -> Self {
        let samples =
            nanos * clock_speed as i128 / (SECONDS_PER_CLOCK_UNIT as i128 * NANOS_PER_SECOND);
        let time = samples.clamp(i64::MIN as i128, i64::MAX as i128) as i64;

        Self::new(time, clock_speed)
    }

    /// Raw sample count.
    pub const fn time(&self) -> i64 {
        self.time
    }

    /// Samples per 1024 seconds.
    pub const fn clock_speed(&self) -> u32 {
        self.clock_speed
    }

    /// Same clock, different sample count.
    pub const fn with_time(&self, time: i64) -> Self {
        Self::new(time, self.clock_speed)
    }

    /// Seconds since the Unix epoch.
    pub fn seconds(&self) -> f64 {
        SECONDS_PER_CLOCK_UNIT as f64 * self.time as f64 / self.clock_speed as f64
    }

    /// Wall-clock instant of this timestamp, if representable.
    pub fn to_system_time(&self) -> Option<SystemTime> {
        if self.clock_speed == 0 {
            return None;
        }

        let nanos = self.time as i128 * SECONDS_PER_CLOCK_UNIT as i128 * NANOS_PER_SECOND
            / self.clock_speed as i128;

        if nanos >= 0 {
            let nanos = u64::try_from(nanos).ok()?;
            UNIX_EPOCH.checked_add(Duration::from_nanos(nanos))
        } else {
            let nanos = u64::try_from(-nanos).ok()?;
            UNIX_EPOCH.checked_sub(Duration::from_nanos(nanos))
        }
    }

    /// Non-negative position of this timestamp in a ring of `len` slots.
    pub fn ring_index(&self, len: usize) -> usize {
        self.time.rem_euclid(len as i64) as usize
    }
}

/// Number of samples covering `duration` at the given clock speed.
pub fn duration_to_samples(duration: Duration, clock_speed: u32) -> i64 {
    let samples = duration.as_nanos() as i128 * clock_speed as i128
        / (SECONDS_PER_CLOCK_UNIT as i128 * NANOS_PER_SECOND);

    samples.min(i64::MAX as i128) as i64
}

/// Samples per second of one subband at the given clock speed.
pub fn subband_bandwidth(clock_speed: u32) -> i64 {
    clock_speed as i64 / SECONDS_PER_CLOCK_UNIT
}

impl PartialEq for TimeStamp {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for TimeStamp {}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl Hash for TimeStamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.time.hash(state);
    }
}

impl Add<i64> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: i64) -> TimeStamp {
        self.with_time(self.time.saturating_add(rhs))
    }
}

impl AddAssign<i64> for TimeStamp {
    fn add_assign(&mut self, rhs: i64) {
        self.time = self.time.saturating_add(rhs);
    }
}

impl Sub<i64> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: i64) -> TimeStamp {
        self.with_time(self.time.saturating_sub(rhs))
    }
}

impl SubAssign<i64> for TimeStamp {
    fn sub_assign(&mut self, rhs: i64) {
        self.time = self.time.saturating_sub(rhs);
    }
}

impl Sub for TimeStamp {
    type Output = i64;

    fn sub(self, rhs: TimeStamp) -> i64 {
        self.time.saturating_sub(rhs.time)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.time)
    }
}

/// Cancellable sleep until a point on the sample axis.
///
/// Waiters park on a condition variable; [`WallClock::cancel`] releases all
/// of them and makes every later wait return immediately.
pub struct WallClock {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Block until the wall clock reaches `deadline`.
    ///
    /// Returns `false` if the clock was cancelled first.
    pub fn wait_until(&self, deadline: TimeStamp) -> bool {
        let target = deadline.to_system_time();
        let mut cancelled = self.cancelled.lock();

        loop {
            if *cancelled {
                return false;
            }

            match target {
                Some(target) => match target.duration_since(SystemTime::now()) {
                    Ok(remaining) if !remaining.is_zero() => {
                        self.wakeup.wait_for(&mut cancelled, remaining);
                    }
                    _ => return true,
                },
                None => self.wakeup.wait(&mut cancelled),
            }
        }
    }

    /// Release all current and future waiters.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WallClock")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    const CLOCK_SPEED: u32 = 2048;

    #[test]
    fn test_ordering_ignores_clock_speed() {
        let a = TimeStamp::new(10, 1024);
        let b = TimeStamp::new(10, 2048);
        let c = TimeStamp::new(11, 1024);

        assert_eq!(a, b);
        assert!(a < c);
        assert_eq!(c - a, 1);
    }

    #[test]
    fn test_arithmetic_keeps_clock_speed() {
        let mut ts = TimeStamp::new(100, CLOCK_SPEED) + 28;
        assert_eq!(ts.time(), 128);
        assert_eq!(ts.clock_speed(), CLOCK_SPEED);

        ts -= 200;
        assert_eq!(ts.time(), -72);

        ts += 2;
        assert_eq!((ts - 10).time(), -80);
    }

    #[test]
    fn test_arithmetic_saturates() {
        let max = TimeStamp::max(CLOCK_SPEED);
        assert_eq!((max + 1).time(), i64::MAX);

        let min = TimeStamp::min(CLOCK_SPEED);
        assert_eq!((min - 1).time(), i64::MIN);
        assert_eq!(min - max, i64::MIN);
    }

    #[test]
    fn test_from_date() {
        // 2024-01-01 00:00:00 UTC is 1_704_067_200 seconds after the epoch.
        let ts = TimeStamp::from_date("2024-01-01 00:00:00", CLOCK_SPEED).expect("valid date");
        assert_eq!(ts.time(), 1_704_067_200 * 2);
        assert!((ts.seconds() - 1_704_067_200.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_date_rejects_garbage() {
        let err = TimeStamp::from_date("yesterday", CLOCK_SPEED).unwrap_err();
        assert!(err.to_string().contains("yesterday"));

        assert!(matches!(
            TimeStamp::from_date("2024-01-01 00:00:00", 0),
            Err(ClockError::ZeroClockSpeed)
        ));
    }

    #[test]
    fn test_now_tracks_system_time() {
        let ts = TimeStamp::now(CLOCK_SPEED);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_secs_f64();

        assert!((ts.seconds() - secs).abs() < 2.0);
    }

    #[test]
    fn test_to_system_time() {
        let ts = TimeStamp::new(3, CLOCK_SPEED);
        assert_eq!(
            ts.to_system_time(),
            Some(UNIX_EPOCH + Duration::from_millis(1500))
        );

        assert_eq!(TimeStamp::new(1, 0).to_system_time(), None);
    }

    #[test]
    fn test_ring_index_wraps_negative_times() {
        assert_eq!(TimeStamp::new(17, CLOCK_SPEED).ring_index(16), 1);
        assert_eq!(TimeStamp::new(-1, CLOCK_SPEED).ring_index(16), 15);
        assert_eq!(TimeStamp::new(-16, CLOCK_SPEED).ring_index(16), 0);
    }

    #[test]
    fn test_duration_to_samples() {
        assert_eq!(duration_to_samples(Duration::from_secs(15), CLOCK_SPEED), 30);
        assert_eq!(duration_to_samples(Duration::from_millis(500), CLOCK_SPEED), 1);
        assert_eq!(subband_bandwidth(200_000_000), 195_312);
    }

    #[test]
    fn test_wall_clock_past_deadline_returns_immediately() {
        let clock = WallClock::new();
        let deadline = TimeStamp::now(CLOCK_SPEED) - 10;

        let started = Instant::now();
        assert!(clock.wait_until(deadline));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wall_clock_cancel_releases_waiter() {
        let clock = Arc::new(WallClock::new());
        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.wait_until(TimeStamp::max(CLOCK_SPEED)))
        };

        thread::sleep(Duration::from_millis(20));
        clock.cancel();

        assert!(!waiter.join().expect("waiter thread"));
        assert!(!clock.wait_until(TimeStamp::now(CLOCK_SPEED)));
    }
}
