//! Time sources.
//!
//! Two different clocks matter to the admission plane:
//!
//! - **Wall-clock seconds** – knock timestamps and token `iat`/`exp` claims
//!   travel between machines, so they are Unix seconds.
//! - **Monotonic instants** – replay records and admission entries never
//!   leave the process; their expiry uses [`Instant`] so that a wall-clock
//!   jump cannot resurrect or prematurely kill an entry.
//!
//! Everything that needs the time receives an `Arc<dyn Clock>`.  Production
//! code injects [`SystemClock`]; tests inject [`ManualClock`] and move time
//! forward explicitly instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of wall-clock seconds and monotonic instants.
pub trait Clock: Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn unix_seconds(&self) -> i64;

    /// A monotonic instant used for in-memory expiry.
    fn instant(&self) -> Instant;
}

/// The operating-system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        unix_now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Both readings start at the real current time so that knocks built with a
/// [`SystemClock`] on the other side still pass the freshness check.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use sdp_core::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let before = clock.unix_seconds();
/// clock.advance(Duration::from_secs(31));
/// assert_eq!(clock.unix_seconds(), before + 31);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_unix: i64,
    offset_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at the current time.
    pub fn new() -> Self {
        Self::starting_at(unix_now())
    }

    /// Creates a clock whose wall-clock reading starts at `unix_seconds`.
    pub fn starting_at(unix_seconds: i64) -> Self {
        Self {
            base_instant: Instant::now(),
            base_unix: unix_seconds,
            offset_ms: AtomicU64::new(0),
        }
    }

    /// Moves both readings forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn unix_seconds(&self) -> i64 {
        self.base_unix + self.offset().as_secs() as i64
    }

    fn instant(&self) -> Instant {
        self.base_instant + self.offset()
    }
}

/// Returns the current time as seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_reports_positive_unix_time() {
        // Arrange / Act
        let now = SystemClock.unix_seconds();

        // Assert
        assert!(now > 1_600_000_000, "clock must be past 2020");
    }

    #[test]
    fn test_manual_clock_does_not_move_on_its_own() {
        // Arrange
        let clock = ManualClock::starting_at(1_700_000_000);
        let first = clock.instant();

        // Act
        std::thread::sleep(Duration::from_millis(5));

        // Assert
        assert_eq!(clock.instant(), first);
        assert_eq!(clock.unix_seconds(), 1_700_000_000);
    }

    #[test]
    fn test_manual_clock_advance_moves_both_readings() {
        // Arrange
        let clock = ManualClock::starting_at(1_700_000_000);
        let start = clock.instant();

        // Act
        clock.advance(Duration::from_secs(31));

        // Assert
        assert_eq!(clock.unix_seconds(), 1_700_000_031);
        assert_eq!(clock.instant() - start, Duration::from_secs(31));
    }
}
