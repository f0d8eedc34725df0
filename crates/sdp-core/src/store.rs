//! Concurrent maps whose entries expire on their own.
//!
//! The replay guard, the gateway's admission gate and its used-token list all
//! need the same thing: remember a key for a while, answer "is it still
//! there?" quickly from many tasks at once, and never grow without bound.
//! [`ExpiringStore`] names that capability; [`ShardedExpiringStore`] is the
//! in-process implementation.
//!
//! # Reclaiming memory
//!
//! Expired entries are reclaimed three ways:
//!
//! 1. **Lazily** – a lookup that finds an expired entry removes it.
//! 2. **Every N inserts** – the inserting task sweeps the whole map.
//! 3. **Explicitly** – [`ExpiringStore::sweep`], which the binaries call from
//!    a periodic task.
//!
//! # When the store is full
//!
//! An insert that would push the map past `max_entries` sweeps first.  If
//! every entry is still live, the [`Overflow`] policy decides:
//!
//! - [`Overflow::RefuseNew`] (the default) refuses the new key and keeps
//!   every live entry.  The replay guard and the used-token list depend on
//!   this: dropping a live record would let its knock or token through again.
//! - [`Overflow::EvictEarliest`] drops the live entry closest to expiry.  Only
//!   stores where losing an entry denies access, such as the admission gate,
//!   use it.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::time::Clock;

/// Inserts between automatic sweeps.
pub const DEFAULT_SWEEP_EVERY: u64 = 1000;

/// What a full store does with a key it has no room for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Refuse the new key.  Live entries are never dropped.
    #[default]
    RefuseNew,
    /// Drop the live entry closest to expiry to make room.
    EvictEarliest,
}

/// Result of [`ExpiringStore::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// A live entry for the key already exists.
    Present,
    /// The store is full of live entries and refuses new keys.
    Full,
}

impl InsertOutcome {
    pub fn is_stored(self) -> bool {
        self == InsertOutcome::Stored
    }
}

/// A key-value map whose entries disappear after a time-to-live.
///
/// An entry is live while `now < inserted_at + ttl`.  Expired entries behave
/// exactly like absent ones in every method.
pub trait ExpiringStore<K, V>: Send + Sync {
    /// Inserts `value` unless a live entry for `key` exists.
    ///
    /// The presence check and the insert are one atomic step.  An existing
    /// live entry is reported as [`InsertOutcome::Present`] even when the
    /// store is full.
    fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> InsertOutcome;

    /// Inserts `value`, replacing any existing entry and its expiry.
    ///
    /// Returns `false` if the key was new and the store refused it.
    fn upsert(&self, key: K, value: V, ttl: Duration) -> bool;

    fn exists(&self, key: &K) -> bool;

    fn get(&self, key: &K) -> Option<V>;

    /// Removes the entry, returning its value only if it was still live.
    fn remove(&self, key: &K) -> Option<V>;

    /// Drops every expired entry and returns how many were dropped.
    fn sweep(&self) -> usize;

    /// Number of stored entries, including expired ones not yet swept.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// [`ExpiringStore`] backed by a sharded [`DashMap`].
///
/// Reads on different shards never contend; a write locks one shard for the
/// duration of a single map operation.
pub struct ShardedExpiringStore<K, V> {
    entries: DashMap<K, Slot<V>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    overflow: Overflow,
    sweep_every: u64,
    inserts: AtomicU64,
}

impl<K, V> ShardedExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a store holding at most `max_entries` entries.  A full store
    /// refuses new keys; see [`with_overflow`](Self::with_overflow).
    pub fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(max_entries.min(4096)),
            clock,
            max_entries: max_entries.max(1),
            overflow: Overflow::default(),
            sweep_every: DEFAULT_SWEEP_EVERY,
            inserts: AtomicU64::new(0),
        }
    }

    pub fn with_overflow(mut self, overflow: Overflow) -> Self {
        self.overflow = overflow;
        self
    }

    /// Overrides how many inserts happen between automatic sweeps.
    pub fn with_sweep_every(mut self, inserts: u64) -> Self {
        self.sweep_every = inserts.max(1);
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Brings the map back under `max_entries` after `key` was written.
    ///
    /// `grew` says whether the write added a key rather than replacing one.
    /// Returns `false` when the new key has to be refused.
    fn make_room(&self, key: &K, grew: bool) -> bool {
        let count = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.sweep_every == 0 {
            self.sweep();
        }
        while self.entries.len() > self.max_entries {
            if self.sweep() > 0 {
                continue;
            }
            match self.overflow {
                Overflow::RefuseNew => return !grew,
                Overflow::EvictEarliest => {
                    if !self.evict_earliest(key) {
                        break;
                    }
                }
            }
        }
        true
    }

    /// Takes back a write that [`make_room`](Self::make_room) refused.
    fn refuse(&self, key: &K, expires_at: Instant) {
        self.entries
            .remove_if(key, |_, slot| slot.expires_at == expires_at);
        debug!(
            capacity = self.max_entries,
            "expiring store full of live entries, refused new entry"
        );
    }

    /// Removes the live entry closest to expiry, never `keep`.
    fn evict_earliest(&self, keep: &K) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                debug!(capacity = self.max_entries, "expiring store full, evicted earliest entry");
                true
            }
            None => false,
        }
    }

    fn live_value(&self, key: &K, now: Instant) -> Option<V> {
        let found = self
            .entries
            .get(key)
            .map(|slot| (slot.expires_at > now).then(|| slot.value.clone()));
        match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.entries.remove_if(key, |_, slot| slot.expires_at <= now);
                None
            }
            None => None,
        }
    }
}

impl<K, V> ExpiringStore<K, V> for ShardedExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> InsertOutcome {
        let now = self.clock.instant();
        let expires_at = now + ttl;
        let slot = Slot { value, expires_at };
        let grew = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return InsertOutcome::Present;
                }
                occupied.insert(slot);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        };
        // The shard lock is released here, so sweeping cannot deadlock.
        if self.make_room(&key, grew) {
            InsertOutcome::Stored
        } else {
            self.refuse(&key, expires_at);
            InsertOutcome::Full
        }
    }

    fn upsert(&self, key: K, value: V, ttl: Duration) -> bool {
        let expires_at = self.clock.instant() + ttl;
        let grew = self
            .entries
            .insert(key.clone(), Slot { value, expires_at })
            .is_none();
        if self.make_room(&key, grew) {
            true
        } else {
            self.refuse(&key, expires_at);
            false
        }
    }

    fn exists(&self, key: &K) -> bool {
        self.live_value(key, self.clock.instant()).is_some()
    }

    fn get(&self, key: &K) -> Option<V> {
        self.live_value(key, self.clock.instant())
    }

    fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.instant();
        self.entries
            .remove(key)
            .and_then(|(_, slot)| (slot.expires_at > now).then_some(slot.value))
    }

    fn sweep(&self) -> usize {
        let now = self.clock.instant();
        let mut dropped = 0;
        self.entries.retain(|_, slot| {
            let live = slot.expires_at > now;
            if !live {
                dropped += 1;
            }
            live
        });
        dropped
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
