//! Replay guard for knock nonces.
//!
//! A knock is only valid once.  The guard remembers every `(device_id,
//! nonce)` pair it has accepted for long enough that the same packet can no
//! longer pass the freshness check: twice the permitted clock skew plus a
//! small margin.  Anything older is rejected as stale before the guard is
//! even consulted.
//!
//! A full guard refuses new nonces instead of forgetting old ones, so the
//! knocks it cannot record are dropped.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::device::DeviceId;
use crate::protocol::messages::Nonce;
use crate::store::{ExpiringStore, InsertOutcome, ShardedExpiringStore};
use crate::time::Clock;

/// Extra retention on top of the skew window.
pub const REPLAY_MARGIN: Duration = Duration::from_secs(5);

/// Default maximum number of remembered nonces.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100_000;

type ReplayKey = (DeviceId, Nonce);

/// Remembers accepted knock nonces.
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn ExpiringStore<ReplayKey, ()>>,
    retention: Duration,
}

impl ReplayGuard {
    /// Wraps an existing store.
    pub fn new(store: Arc<dyn ExpiringStore<ReplayKey, ()>>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Builds a guard over an in-memory store sized for `max_clock_skew`.
    pub fn in_memory(clock: Arc<dyn Clock>, max_clock_skew: Duration, capacity: usize) -> Self {
        let store: ShardedExpiringStore<ReplayKey, ()> = ShardedExpiringStore::new(clock, capacity);
        Self::new(Arc::new(store), retention_for_skew(max_clock_skew))
    }

    /// Returns `true` if this nonce has already been accepted.  Read only.
    pub fn check(&self, device_id: &DeviceId, nonce: &Nonce) -> bool {
        self.store.exists(&(device_id.clone(), *nonce))
    }

    /// Records the nonce.
    ///
    /// [`InsertOutcome::Present`] means the knock is a replay;
    /// [`InsertOutcome::Full`] means the guard cannot vouch for it.
    pub fn record(&self, device_id: &DeviceId, nonce: &Nonce) -> InsertOutcome {
        self.store
            .insert_if_absent((device_id.clone(), *nonce), (), self.retention)
    }

    pub fn sweep(&self) -> usize {
        self.store.sweep()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

/// How long a nonce must be remembered for a given skew tolerance.
pub fn retention_for_skew(max_clock_skew: Duration) -> Duration {
    max_clock_skew * 2 + REPLAY_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn guard() -> (Arc<ManualClock>, ReplayGuard) {
        let clock = Arc::new(ManualClock::new());
        let guard = ReplayGuard::in_memory(clock.clone(), Duration::from_secs(30), 1024);
        (clock, guard)
    }

    #[test]
    fn test_retention_covers_both_sides_of_the_skew_window() {
        assert_eq!(
            retention_for_skew(Duration::from_secs(30)),
            Duration::from_secs(65)
        );
    }

    #[test]
    fn test_second_record_of_same_nonce_is_a_replay() {
        // Arrange
        let (_clock, guard) = guard();
        let id = DeviceId::new("dev-1").unwrap();
        let nonce = [0x22u8; 16];

        // Act
        let first = guard.record(&id, &nonce);
        let second = guard.record(&id, &nonce);

        // Assert
        assert_eq!(first, InsertOutcome::Stored);
        assert_eq!(second, InsertOutcome::Present);
        assert!(guard.check(&id, &nonce));
    }

    #[test]
    fn test_same_nonce_from_different_devices_is_independent() {
        // Arrange
        let (_clock, guard) = guard();
        let nonce = [0x33u8; 16];

        // Act / Assert
        assert!(guard.record(&DeviceId::new("dev-1").unwrap(), &nonce).is_stored());
        assert!(guard.record(&DeviceId::new("dev-2").unwrap(), &nonce).is_stored());
    }

    #[test]
    fn test_check_does_not_record() {
        // Arrange
        let (_clock, guard) = guard();
        let id = DeviceId::new("dev-1").unwrap();
        let nonce = [0x44u8; 16];

        // Act
        let seen = guard.check(&id, &nonce);

        // Assert
        assert!(!seen);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_nonce_is_forgotten_after_retention() {
        // Arrange
        let (clock, guard) = guard();
        let id = DeviceId::new("dev-1").unwrap();
        let nonce = [0x55u8; 16];
        guard.record(&id, &nonce);

        // Act
        clock.advance(guard.retention());

        // Assert
        assert!(!guard.check(&id, &nonce));
        assert_eq!(guard.sweep(), 0, "lazy expiry already removed it");
    }

    #[test]
    fn test_full_guard_keeps_recorded_nonces() {
        // Arrange
        let clock = Arc::new(ManualClock::new());
        let guard = ReplayGuard::in_memory(clock.clone(), Duration::from_secs(30), 4);
        let victim = DeviceId::new("dev-1").unwrap();
        let flooder = DeviceId::new("dev-2").unwrap();
        guard.record(&victim, &[0x66; 16]);
        clock.advance(Duration::from_secs(1));

        // Act
        let flood: Vec<_> = (0..4u8)
            .map(|i| guard.record(&flooder, &[i; 16]))
            .collect();
        let replay = guard.record(&victim, &[0x66; 16]);

        // Assert
        assert!(flood[..3].iter().all(|o| o.is_stored()));
        assert_eq!(flood[3], InsertOutcome::Full);
        assert_eq!(replay, InsertOutcome::Present);
        assert_eq!(guard.len(), 4);
    }
}
