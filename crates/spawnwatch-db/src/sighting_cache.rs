//! De-duplication cache for sighting inserts.
//!
//! Scanners report the same encounter many times while it is visible. The
//! cache remembers every encounter the session has committed, per table,
//! together with the epoch second after which it can no longer be reported,
//! so repeat inserts skip the database round-trip. Expired entries are
//! dropped when the worker runs cache maintenance.
//!
//! Mysteries and resolved sightings are tracked separately: an encounter
//! first stored as a mystery still gets its sighting row once its spawn
//! point is known.

use dashmap::DashMap;
use spawnwatch_core::{CacheExpiry, MaintenanceError};
use spawnwatch_types::EncounterId;

/// How long a mystery sighting stays in the cache, in seconds. Mysteries
/// carry no expiry of their own.
pub const MYSTERY_RETENTION_SECS: i64 = 3600;

/// Which table a cached encounter was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SightingKind {
    /// The `sightings` table.
    Resolved,
    /// The `mystery_sightings` table.
    Mystery,
}

/// Committed encounters keyed by table and id, valued by expiry (epoch
/// seconds).
#[derive(Debug, Default)]
pub struct SightingCache {
    entries: DashMap<(SightingKind, EncounterId), i64>,
}

impl SightingCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `encounter` has already been persisted as `kind`.
    pub fn contains(&self, kind: SightingKind, encounter: EncounterId) -> bool {
        self.entries.contains_key(&(kind, encounter))
    }

    /// Remember `encounter` as `kind` until `expires_at`. A later expiry
    /// wins.
    pub fn insert(&self, kind: SightingKind, encounter: EncounterId, expires_at: i64) {
        self.entries
            .entry((kind, encounter))
            .and_modify(|current| *current = (*current).max(expires_at))
            .or_insert(expires_at);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry that expired before `now`. Returns how many were
    /// dropped.
    pub fn expire_before(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at >= now);
        before.saturating_sub(self.entries.len())
    }
}

impl CacheExpiry for SightingCache {
    fn expire_stale_entries(&self) -> Result<usize, MaintenanceError> {
        let removed = self.expire_before(chrono::Utc::now().timestamp());
        tracing::debug!(removed, remaining = self.entries.len(), "Sighting cache cleaned");
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use SightingKind::{Mystery, Resolved};

    #[test]
    fn expire_before_drops_only_stale_entries() {
        let cache = SightingCache::new();
        cache.insert(Resolved, EncounterId(1), 100);
        cache.insert(Resolved, EncounterId(2), 200);
        cache.insert(Mystery, EncounterId(3), 300);

        assert_eq!(cache.expire_before(200), 1);
        assert!(!cache.contains(Resolved, EncounterId(1)));
        assert!(cache.contains(Resolved, EncounterId(2)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn later_expiry_wins() {
        let cache = SightingCache::new();
        cache.insert(Resolved, EncounterId(1), 500);
        cache.insert(Resolved, EncounterId(1), 100);
        assert_eq!(cache.expire_before(400), 0);
        cache.insert(Resolved, EncounterId(1), 900);
        assert_eq!(cache.expire_before(800), 0);
        assert_eq!(cache.expire_before(901), 1);
    }

    #[test]
    fn mystery_and_resolved_entries_are_independent() {
        let cache = SightingCache::new();
        cache.insert(Mystery, EncounterId(5), 1_000);

        assert!(cache.contains(Mystery, EncounterId(5)));
        assert!(!cache.contains(Resolved, EncounterId(5)));

        cache.insert(Resolved, EncounterId(5), 50);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.expire_before(100), 1);
        assert!(cache.contains(Mystery, EncounterId(5)));
    }

    #[test]
    fn maintenance_is_idempotent() {
        let cache = SightingCache::new();
        cache.insert(Resolved, EncounterId(1), 0);
        cache.insert(Mystery, EncounterId(2), i64::MAX);

        assert_eq!(cache.expire_stale_entries().unwrap(), 1);
        assert_eq!(cache.expire_stale_entries().unwrap(), 0);
        assert!(cache.contains(Mystery, EncounterId(2)));
    }
}
