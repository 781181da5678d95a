//! Time sources.
//!
//! The engine needs wall time for TOTP challenges and monotonic time for
//! response timeouts. Both come from a [`Clock`] so tests can drive them.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of wall and monotonic time.
pub trait Clock {
    /// Seconds since the Unix epoch.
    fn unix_seconds(&self) -> u64;

    /// A monotonic instant.
    fn now(&self) -> Instant;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give the
/// other to the engine.
///
/// ```
/// use std::time::Duration;
/// use yubikey_oath_core::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(59);
/// let handle = clock.clone();
/// handle.advance(Duration::from_secs(1));
/// assert_eq!(clock.unix_seconds(), 60);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Rc<Cell<Duration>>,
    unix_origin: u64,
}

impl ManualClock {
    /// Creates a clock reading `unix_seconds`.
    #[must_use]
    pub fn new(unix_seconds: u64) -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
            unix_origin: unix_seconds,
        }
    }

    /// Moves both readings forward.
    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }
}

impl Clock for ManualClock {
    fn unix_seconds(&self) -> u64 {
        self.unix_origin + self.elapsed.get().as_secs()
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }
}
