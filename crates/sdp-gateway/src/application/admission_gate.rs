//! Admission entries: who may open a TCP connection, from where, until when.
//!
//! A successful knock on the gateway's SPA port admits the knock's source IP
//! for a short time.  The TLS listener consumes the entry on the first TCP
//! attempt from that IP, whatever the outcome of the handshake, so one knock
//! buys exactly one connection attempt.
//!
//! Entries are keyed by IP only: the TCP source port is chosen by the
//! client's kernel and differs from the UDP port the knock came from.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use sdp_core::{Clock, Device, ExpiringStore, Overflow, ShardedExpiringStore};
use tracing::{debug, warn};

/// Default lifetime of an admission entry.
pub const DEFAULT_ADMISSION_TTL: Duration = Duration::from_secs(30);

/// Default maximum number of simultaneously admitted addresses.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 10_000;

/// One admitted source address.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The device whose knock created the entry.  Gate 2 checks the client
    /// certificate against this device's identity binding.
    pub device: Arc<Device>,
    /// Unix seconds at which the entry was created.
    pub admitted_at: i64,
}

/// Single-use admission entries with a time-to-live.
#[derive(Clone)]
pub struct AdmissionGate {
    entries: Arc<dyn ExpiringStore<IpAddr, Admission>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl AdmissionGate {
    pub fn new(
        entries: Arc<dyn ExpiringStore<IpAddr, Admission>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self { entries, clock, ttl }
    }

    /// An in-memory gate holding at most `capacity` entries.  When full, the
    /// entry closest to expiry is dropped; its address has to knock again.
    pub fn in_memory(clock: Arc<dyn Clock>, ttl: Duration, capacity: usize) -> Self {
        let store: ShardedExpiringStore<IpAddr, Admission> =
            ShardedExpiringStore::new(Arc::clone(&clock), capacity)
                .with_overflow(Overflow::EvictEarliest);
        Self::new(Arc::new(store), clock, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Admits `ip` on behalf of `device`.
    ///
    /// A newer knock from the same address replaces the older entry and
    /// restarts its lifetime.
    pub fn admit(&self, ip: IpAddr, device: Arc<Device>) {
        debug!(
            %ip,
            device_id = %device.device_id,
            ttl_secs = self.ttl.as_secs(),
            "address admitted"
        );
        let admission = Admission {
            device,
            admitted_at: self.clock.unix_seconds(),
        };
        if !self.entries.upsert(ip, admission, self.ttl) {
            warn!(%ip, "admission gate full, address not admitted");
        }
    }

    /// Consumes the entry for `ip`.  Returns `None` if there is no live entry.
    pub fn take(&self, ip: IpAddr) -> Option<Admission> {
        self.entries.remove(&ip)
    }

    pub fn is_admitted(&self, ip: IpAddr) -> bool {
        self.entries.exists(&ip)
    }

    /// Drops expired entries.
    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
