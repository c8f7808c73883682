//! Readiness snapshot cache
//!
//! Entries are keyed by `(user, hour)`, where the hour is the evaluation
//! time rounded up to the next whole hour. A write for a user at time `t`
//! removes every entry of that user with `as_of >= t`; earlier entries are
//! still valid because nothing they depend on changed.
//!
//! Each invalidation also bumps a per-user generation. A reader that
//! captured the generation before fetching stores its result with
//! [`SnapshotCache::put_if_unchanged`], which refuses the write if an
//! invalidation happened in between.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::fitness_fatigue::FatigueState;
use crate::readiness::ReadinessSnapshot;

/// A cached readiness result plus the state needed to resume from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReadiness {
    pub snapshot: ReadinessSnapshot,

    /// Fitness-fatigue state at `snapshot.as_of`; absent for degraded snapshots
    pub fatigue_state: Option<FatigueState>,

    /// Timestamp of the user's first-ever event, when known
    pub history_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept per user before the oldest are evicted
    pub max_entries_per_user: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries_per_user: 168,
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidated: u64,
    pub evicted: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Round up to the next whole hour; exact hours are unchanged
pub fn hour_key(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    if secs.rem_euclid(3600) == 0 && t.timestamp_subsec_nanos() == 0 {
        return t;
    }

    let next = (secs.div_euclid(3600) + 1) * 3600;
    DateTime::<Utc>::from_timestamp(next, 0).unwrap_or(t)
}

/// In-process snapshot cache shared by concurrent readiness requests
#[derive(Default)]
pub struct SnapshotCache {
    config: CacheConfig,
    entries: RwLock<BTreeMap<(String, DateTime<Utc>), CachedReadiness>>,

    /// Invalidation count per user; only taken while holding `entries`
    generations: Mutex<HashMap<String, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
    evicted: AtomicU64,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        SnapshotCache {
            config,
            ..Default::default()
        }
    }

    // Entries are recomputable, so a poisoned lock is recovered rather than propagated
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<(String, DateTime<Utc>), CachedReadiness>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<(String, DateTime<Utc>), CachedReadiness>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.generations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current write generation of a user
    pub fn generation(&self, user_id: &str) -> u64 {
        let _entries = self.read();
        self.generations().get(user_id).copied().unwrap_or(0)
    }

    /// Exact lookup for an hour key
    pub fn get(&self, user_id: &str, as_of: DateTime<Utc>) -> Option<CachedReadiness> {
        let found = self.read().get(&(user_id.to_string(), as_of)).cloned();

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };

        found
    }

    pub fn put(&self, user_id: &str, cached: CachedReadiness) {
        let mut entries = self.write();
        self.insert(&mut entries, user_id, cached);
    }

    /// Store `cached` only if the user saw no invalidation since `generation`
    ///
    /// Returns whether the entry was stored.
    pub fn put_if_unchanged(&self, user_id: &str, cached: CachedReadiness, generation: u64) -> bool {
        let mut entries = self.write();
        let current = self.generations().get(user_id).copied().unwrap_or(0);
        if current != generation {
            debug!(user_id, generation, current, "Discarded snapshot computed before a write");
            return false;
        }

        self.insert(&mut entries, user_id, cached);
        true
    }

    fn insert(
        &self,
        entries: &mut BTreeMap<(String, DateTime<Utc>), CachedReadiness>,
        user_id: &str,
        cached: CachedReadiness,
    ) {
        entries.insert((user_id.to_string(), cached.snapshot.as_of), cached);

        let user_keys: Vec<(String, DateTime<Utc>)> = entries
            .range(user_range(user_id))
            .map(|(key, _)| key.clone())
            .collect();

        if user_keys.len() > self.config.max_entries_per_user {
            let excess = user_keys.len() - self.config.max_entries_per_user;
            for key in user_keys.into_iter().take(excess) {
                entries.remove(&key);
            }
            self.evicted.fetch_add(excess as u64, Ordering::Relaxed);
        }
    }

    /// Newest entry for the user with `as_of <= t`
    pub fn latest_at_or_before(&self, user_id: &str, t: DateTime<Utc>) -> Option<CachedReadiness> {
        self.read()
            .range((user_id.to_string(), DateTime::<Utc>::MIN_UTC)..=(user_id.to_string(), t))
            .next_back()
            .map(|(_, cached)| cached.clone())
    }

    /// Drop the user's entries with `as_of >= t`, returning how many went
    pub fn invalidate_from(&self, user_id: &str, t: DateTime<Utc>) -> usize {
        let mut entries = self.write();
        *self.generations().entry(user_id.to_string()).or_insert(0) += 1;

        let before = entries.len();
        entries.retain(|(user, as_of), _| !(user == user_id && *as_of >= t));

        let removed = before - entries.len();
        if removed > 0 {
            self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(user_id, from = %t, removed, "Invalidated cached snapshots");
        }
        removed
    }

    pub fn invalidate_user(&self, user_id: &str) -> usize {
        self.invalidate_from(user_id, DateTime::<Utc>::MIN_UTC)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

fn user_range(
    user_id: &str,
) -> std::ops::RangeInclusive<(String, DateTime<Utc>)> {
    (user_id.to_string(), DateTime::<Utc>::MIN_UTC)..=(user_id.to_string(), DateTime::<Utc>::MAX_UTC)
}
