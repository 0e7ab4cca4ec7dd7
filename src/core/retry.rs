//! core::retry
//!
//! Bounded polling for things that become ready asynchronously: the
//! daemon's control socket and the container id file.
//!
//! A [`RetryPolicy`] is a plain value (`interval`, `patience`). Polling goes
//! through a [`Clock`] so tests can run against [`VirtualClock`] without
//! sleeping.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use strata::core::retry::{Poll, RetryPolicy, VirtualClock};
//!
//! let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50));
//! let clock = VirtualClock::default();
//! let mut attempts = 0;
//! let found: Result<Option<u32>, ()> = policy.poll_with(&clock, || {
//!     attempts += 1;
//!     Ok(if attempts == 3 { Poll::Ready(7) } else { Poll::Pending })
//! });
//! assert_eq!(found, Ok(Some(7)));
//! ```

use std::cell::Cell;
use std::time::{Duration, Instant};

/// How often to probe and how long to keep trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub patience: Duration,
}

impl RetryPolicy {
    /// Probing a daemon that may already be running.
    pub const PROBE: RetryPolicy = RetryPolicy {
        interval: Duration::from_millis(10),
        patience: Duration::from_millis(500),
    };

    /// Waiting for a daemon this process just spawned.
    pub const SPAWN: RetryPolicy = RetryPolicy {
        interval: Duration::from_millis(100),
        patience: Duration::from_secs(10),
    };

    /// Waiting for the runtime to write a container id.
    pub const CID: RetryPolicy = RetryPolicy {
        interval: Duration::from_millis(100),
        patience: Duration::from_secs(2),
    };

    pub const fn new(interval: Duration, patience: Duration) -> Self {
        Self { interval, patience }
    }

    /// Poll on the wall clock.
    pub fn poll<T, E>(&self, probe: impl FnMut() -> Result<Poll<T>, E>) -> Result<Option<T>, E> {
        self.poll_with(&SystemClock, probe)
    }

    /// Call `probe` until it is ready, fails, or patience runs out.
    ///
    /// The probe always runs at least once, and once more at the deadline.
    /// `Ok(None)` means the deadline passed while still pending.
    pub fn poll_with<T, E>(
        &self,
        clock: &dyn Clock,
        mut probe: impl FnMut() -> Result<Poll<T>, E>,
    ) -> Result<Option<T>, E> {
        let deadline = clock.now() + self.patience;
        loop {
            if let Poll::Ready(value) = probe()? {
                return Ok(Some(value));
            }
            let now = clock.now();
            if now >= deadline {
                return Ok(None);
            }
            clock.sleep(self.interval.min(deadline - now));
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Source of time for polling.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only advances when slept on.
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    elapsed: Cell<Duration>,
    sleeps: Cell<usize>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: Cell::new(0),
        }
    }
}

impl VirtualClock {
    /// Total virtual time slept.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Number of sleeps taken.
    pub fn sleeps(&self) -> usize {
        self.sleeps.get()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
        self.sleeps.set(self.sleeps.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn ready_immediately_never_sleeps() {
        let clock = VirtualClock::default();
        let got: Result<_, ()> = RetryPolicy::new(ms(10), ms(100)).poll_with(&clock, || Ok(Poll::Ready(1)));
        assert_eq!(got, Ok(Some(1)));
        assert_eq!(clock.sleeps(), 0);
    }

    #[test]
    fn times_out_at_patience() {
        let clock = VirtualClock::default();
        let mut probes = 0;
        let got: Result<Option<()>, ()> = RetryPolicy::new(ms(10), ms(100)).poll_with(&clock, || {
            probes += 1;
            Ok(Poll::Pending)
        });
        assert_eq!(got, Ok(None));
        assert_eq!(clock.elapsed(), ms(100));
        assert_eq!(probes, 11);
    }

    #[test]
    fn last_sleep_is_clamped_to_deadline() {
        let clock = VirtualClock::default();
        let _: Result<Option<()>, ()> =
            RetryPolicy::new(ms(30), ms(100)).poll_with(&clock, || Ok(Poll::Pending));
        assert_eq!(clock.elapsed(), ms(100));
        assert_eq!(clock.sleeps(), 4);
    }

    #[test]
    fn error_stops_polling() {
        let clock = VirtualClock::default();
        let mut probes = 0;
        let got: Result<Option<()>, &str> = RetryPolicy::new(ms(10), ms(100)).poll_with(&clock, || {
            probes += 1;
            if probes == 2 {
                Err("fatal")
            } else {
                Ok(Poll::Pending)
            }
        });
        assert_eq!(got, Err("fatal"));
        assert_eq!(probes, 2);
    }

    #[test]
    fn cid_policy_allows_twenty_retries() {
        let policy = RetryPolicy::CID;
        assert_eq!(policy.patience.as_millis() / policy.interval.as_millis(), 20);
    }

    #[test]
    fn spawn_is_more_patient_than_probe() {
        assert!(RetryPolicy::SPAWN.patience > RetryPolicy::PROBE.patience);
    }
}
