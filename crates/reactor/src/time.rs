//! Local clock types and the user-driven timer manager.
use std::sync::atomic;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    /// Milliseconds since Epoch.
    millis: u128,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = u64::try_from(Self::from(SystemTime::now()).millis).unwrap_or(u64::MAX);
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time instead.
        if now < last {
            Self::from_millis(last as u128)
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self::from_millis(now as u128)
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct a local time from milliseconds since Epoch.
    pub const fn from_millis(millis: u128) -> Self {
        Self { millis }
    }

    /// Convert to whole seconds since Epoch.
    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000).try_into().unwrap()
    }

    /// Get the duration since the given time.
    ///
    /// # Panics
    ///
    /// This function will panic if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_millis(
            self.millis
                .checked_sub(earlier.millis)
                .expect("supplied time is later than self"),
        )
    }
}

/// Convert a `SystemTime` into a local time.
impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system.duration_since(UNIX_EPOCH).unwrap().as_millis();

        Self { millis }
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(u128::MAX);

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else {
            write!(f, "{} second(s)", self.as_secs())
        }
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

/// Identifies one armed timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Alarm invoked when an armed timer expires.
type Alarm = Arc<dyn Fn() + Send + Sync>;

struct Armed {
    token: TimerToken,
    deadline: LocalTime,
    alarm: Alarm,
}

/// Manages one-shot timers and fires their alarms.
///
/// The manager does not tick by itself: the owner of the event loop calls
/// [`TimerManager::tick`] with the current time, typically once per poll
/// iteration. Alarms run on the ticking thread, outside the manager's lock,
/// so an alarm may arm or disarm timers.
pub struct TimerManager {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Armed timers, sorted by deadline with the soonest last.
    armed: Vec<Armed>,
    next_token: u64,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    /// Create a new timer manager with no armed timers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                armed: Vec::new(),
                next_token: 0,
            }),
        }
    }

    /// Return the number of armed timers.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().armed.len()
    }

    /// Check whether any timer is armed.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().armed.is_empty()
    }

    /// Arm a one-shot timer expiring at `deadline`.
    pub fn arm(&self, deadline: LocalTime, alarm: impl Fn() + Send + Sync + 'static) -> TimerToken {
        let mut inner = self.inner.lock().unwrap();
        let token = TimerToken(inner.next_token);
        inner.next_token += 1;

        inner.armed.push(Armed {
            token,
            deadline,
            alarm: Arc::new(alarm),
        });
        inner
            .armed
            .sort_unstable_by(|a, b| b.deadline.cmp(&a.deadline));

        token
    }

    /// Disarm a timer. Returns `false` if it already fired or was disarmed.
    pub fn disarm(&self, token: TimerToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.armed.len();

        inner.armed.retain(|armed| armed.token != token);
        inner.armed.len() != before
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<LocalTime> {
        let inner = self.inner.lock().unwrap();

        inner.armed.last().map(|armed| armed.deadline)
    }

    /// Fire every timer whose deadline is at or before `now`.
    ///
    /// Returns the number of alarms fired.
    pub fn tick(&self, now: LocalTime) -> usize {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();

            while let Some(armed) = inner.armed.pop() {
                if now >= armed.deadline {
                    due.push(armed.alarm);
                } else {
                    inner.armed.push(armed);
                    break;
                }
            }
        }

        for alarm in &due {
            alarm();
        }
        due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tick_fires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let t0 = LocalTime::from_secs(100);

        for (label, secs) in [("b", 130), ("a", 110), ("c", 150)] {
            let order = order.clone();
            mgr.arm(LocalTime::from_secs(secs), move || {
                order.lock().unwrap().push(label);
            });
        }

        assert_eq!(mgr.next_deadline(), Some(LocalTime::from_secs(110)));
        assert_eq!(mgr.tick(t0), 0);
        assert_eq!(mgr.tick(LocalTime::from_secs(140)), 2);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(mgr.tick(LocalTime::from_secs(200)), 1);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_disarmed_timer_does_not_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let token = mgr.arm(LocalTime::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(mgr.disarm(token));
        assert!(!mgr.disarm(token));
        assert_eq!(mgr.tick(LocalTime::from_secs(20)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_alarm_may_rearm() {
        let mgr = Arc::new(TimerManager::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_mgr = mgr.clone();
        let counter = fired.clone();
        mgr.arm(LocalTime::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = counter.clone();
            inner_mgr.arm(LocalTime::from_secs(2), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(mgr.tick(LocalTime::from_secs(1)), 1);
        assert_eq!(mgr.tick(LocalTime::from_secs(2)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    quickcheck! {
        fn prop_tick_never_fires_early(deadlines: Vec<u64>, now: u64) -> bool {
            let mgr = TimerManager::new();
            let expected = deadlines.iter().filter(|d| **d <= now).count();

            for deadline in &deadlines {
                mgr.arm(LocalTime::from_secs(*deadline), || {});
            }
            let fired = mgr.tick(LocalTime::from_secs(now));

            fired == expected && mgr.len() == deadlines.len() - expected
        }
    }
}
