//! In-memory registry of spawn points, mystery points and altitudes.
//!
//! The registry answers high-frequency point queries from producer threads
//! and is written to by the persistence worker as it learns new spawn
//! offsets. All maps are [`DashMap`]s, so every read or write holds a shard
//! lock for a single key only and no lock is ever held across I/O.
//!
//! # Despawn prediction
//!
//! A spawn point stores only its hour-relative [`DespawnOffset`]. The
//! absolute despawn time is rebuilt against the hour containing the
//! observation time:
//!
//! ```text
//! hour_start = observed_at - observed_at mod 3600
//! candidate  = hour_start + offset
//! if observed_at > candidate - 88: candidate += 3600
//! ```
//!
//! An observation within 88 seconds of the offset (or past it) belongs to
//! the next hourly cycle.
//!
//! # Refresh
//!
//! [`SpawnRegistry::refresh`] replaces the offsets with what storage holds
//! but only adds to the mystery and altitude sets, so discoveries not yet
//! persisted survive. A refresh is not atomic with respect to concurrent
//! lookups; a lookup may observe a partially refreshed registry.

use std::collections::HashSet;

use dashmap::{DashMap, DashSet};
use rand::seq::SliceRandom;
use spawnwatch_types::{Coordinate, DespawnOffset, SpawnId};

use crate::altitude::{AltitudeSource, LookupError};
use crate::config::RegistryConfig;
use crate::geo::{RoundedPoint, round_coordinate};
use crate::storage::{SnapshotSource, SpawnPointRecord, StorageError};

/// Observations this close to (or past) the offset roll over to the next
/// hour.
pub const BOUNDARY_TOLERANCE_SECS: i64 = 88;

const HOUR_SECS: i64 = 3600;

/// Errors that can occur during [`SpawnRegistry::refresh`].
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Loading the snapshot from storage failed.
    #[error("failed to load spawn snapshot: {0}")]
    Storage(#[from] StorageError),

    /// Seeding the altitude cache failed.
    #[error("failed to seed altitudes: {0}")]
    Lookup(#[from] LookupError),
}

/// Sizes of the registry after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Spawn points with a known offset.
    pub spawn_points: usize,
    /// Mystery points.
    pub mysteries: usize,
    /// Cached altitudes.
    pub altitudes: usize,
}

/// Shared registry of spawn metadata.
///
/// Construct once and share behind an `Arc`.
pub struct SpawnRegistry {
    offsets: DashMap<SpawnId, DespawnOffset>,
    locations: DashMap<SpawnId, Coordinate>,
    mysteries: DashSet<RoundedPoint>,
    altitudes: DashMap<RoundedPoint, f64>,
    altitude_source: AltitudeSource,
    altitude_precision: u8,
    mystery_precision: u8,
}

impl SpawnRegistry {
    /// Create an empty registry.
    pub fn new(altitude_source: AltitudeSource, config: &RegistryConfig) -> Self {
        Self {
            offsets: DashMap::new(),
            locations: DashMap::new(),
            mysteries: DashSet::new(),
            altitudes: DashMap::new(),
            altitude_source,
            altitude_precision: config.altitude_precision,
            mystery_precision: config.mystery_precision,
        }
    }

    /// Reload from storage.
    ///
    /// Offsets and spawn locations are replaced by the snapshot. Mystery
    /// points and altitudes are merged into what is already in memory. If
    /// the altitude cache is still empty afterwards it is seeded with one
    /// bulk sweep.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Storage`] if the snapshot cannot be loaded
    /// (the registry is left untouched), or [`RefreshError::Lookup`] if the
    /// bulk altitude sweep fails (offsets and mysteries are already applied).
    pub async fn refresh<S: SnapshotSource>(
        &self,
        source: &S,
    ) -> Result<RefreshSummary, RefreshError> {
        let snapshot = source.load_spawn_snapshot().await?;

        let fresh: HashSet<SpawnId> = snapshot.spawn_points.iter().map(|s| s.spawn_id).collect();
        self.offsets.retain(|id, _| fresh.contains(id));
        self.locations.retain(|id, _| fresh.contains(id));
        for record in &snapshot.spawn_points {
            self.record_spawn_point(record);
        }

        for point in snapshot.mysteries {
            self.mysteries
                .insert(round_coordinate(point, self.mystery_precision));
        }
        for (point, altitude) in snapshot.altitudes {
            self.altitudes
                .insert(round_coordinate(point, self.altitude_precision), altitude);
        }

        if self.altitudes.is_empty() {
            tracing::info!(
                source = self.altitude_source.name(),
                "Altitude cache empty, running bulk sweep"
            );
            for (point, altitude) in self.altitude_source.resolve_bulk().await? {
                self.altitudes
                    .insert(round_coordinate(point, self.altitude_precision), altitude);
            }
        }

        let summary = RefreshSummary {
            spawn_points: self.offsets.len(),
            mysteries: self.mysteries.len(),
            altitudes: self.altitudes.len(),
        };
        tracing::info!(
            spawn_points = summary.spawn_points,
            mysteries = summary.mysteries,
            altitudes = summary.altitudes,
            "Spawn registry refreshed"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Spawn points
    // -----------------------------------------------------------------------

    /// Whether the registry knows an offset for `id`.
    pub fn has_spawn_point(&self, id: SpawnId) -> bool {
        self.offsets.contains_key(&id)
    }

    /// Insert or overwrite the offset for `id`.
    pub fn record_despawn_offset(&self, id: SpawnId, offset: DespawnOffset) {
        self.offsets.insert(id, offset);
    }

    /// Insert or overwrite a spawn point's offset and location.
    pub fn record_spawn_point(&self, record: &SpawnPointRecord) {
        self.offsets.insert(record.spawn_id, record.despawn_offset);
        self.locations.insert(record.spawn_id, record.position);
    }

    /// The stored hour-relative offset for `id`.
    pub fn raw_offset(&self, id: SpawnId) -> Option<DespawnOffset> {
        self.offsets.get(&id).map(|entry| *entry.value())
    }

    /// Snapshot of every spawn point with a known location.
    pub fn spawn_locations(&self) -> Vec<(SpawnId, Coordinate)> {
        self.locations
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Absolute despawn time of the entity at `id`, in epoch seconds.
    ///
    /// `observed_at` defaults to now. Returns `None` for unknown spawn
    /// points.
    pub fn despawn_time(&self, id: SpawnId, observed_at: Option<i64>) -> Option<i64> {
        let offset = self.raw_offset(id)?;
        let observed_at = observed_at.unwrap_or_else(now);
        Some(next_despawn(offset, observed_at))
    }

    /// Seconds from now until the offset of `id` next comes around.
    pub fn time_until_hidden(&self, id: SpawnId) -> Option<i64> {
        self.time_until_hidden_at(id, now())
    }

    /// Seconds from `now` until the offset of `id` next comes around.
    ///
    /// Unlike [`despawn_time`](Self::despawn_time) this applies no boundary
    /// correction; it is meant for scheduling re-checks.
    pub fn time_until_hidden_at(&self, id: SpawnId, now: i64) -> Option<i64> {
        self.raw_offset(id)
            .map(|offset| seconds_until_offset(offset, now))
    }

    /// Number of spawn points with a known offset.
    pub fn spawn_count(&self) -> usize {
        self.offsets.len()
    }

    // -----------------------------------------------------------------------
    // Mystery points
    // -----------------------------------------------------------------------

    /// Mark the location of `point` as a mystery. Returns `true` if it was
    /// not already marked.
    pub fn record_mystery(&self, point: Coordinate) -> bool {
        self.mysteries
            .insert(round_coordinate(point, self.mystery_precision))
    }

    /// Whether `point` rounds to a known mystery point.
    pub fn is_mystery(&self, point: Coordinate) -> bool {
        self.mysteries
            .contains(&round_coordinate(point, self.mystery_precision))
    }

    /// All mystery points, in a fresh random order on every call.
    pub fn mystery_points_shuffled(&self) -> Vec<RoundedPoint> {
        let mut points: Vec<RoundedPoint> = self.mysteries.iter().map(|p| *p.key()).collect();
        points.shuffle(&mut rand::rng());
        points
    }

    /// Number of mystery points.
    pub fn mystery_count(&self) -> usize {
        self.mysteries.len()
    }

    /// Spawn points plus mystery points.
    pub fn total_tracked(&self) -> usize {
        self.spawn_count().saturating_add(self.mystery_count())
    }

    // -----------------------------------------------------------------------
    // Altitudes
    // -----------------------------------------------------------------------

    /// Ground altitude at `point`, in meters.
    ///
    /// Answers from the cache when the coarse grid cell is known; otherwise
    /// asks the altitude source, blocking the caller on that request, and
    /// caches the answer.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] if the source cannot resolve the point.
    /// Failures are not cached.
    pub async fn lookup_altitude(&self, point: Coordinate) -> Result<f64, LookupError> {
        let key = round_coordinate(point, self.altitude_precision);
        let cached = self.altitudes.get(&key).map(|entry| *entry.value());
        if let Some(altitude) = cached {
            return Ok(altitude);
        }

        let altitude = self.altitude_source.resolve(key.to_coordinate()).await?;
        self.altitudes.insert(key, altitude);
        tracing::debug!(point = %key, altitude, "Cached altitude");
        Ok(altitude)
    }

    /// Number of cached altitudes.
    pub fn altitude_count(&self) -> usize {
        self.altitudes.len()
    }

    /// The altitude source backing cache misses.
    pub const fn altitude_source(&self) -> &AltitudeSource {
        &self.altitude_source
    }
}

/// Absolute despawn time for `offset` as seen at `observed_at`.
pub fn next_despawn(offset: DespawnOffset, observed_at: i64) -> i64 {
    let hour_start = observed_at.saturating_sub(observed_at.rem_euclid(HOUR_SECS));
    let candidate = hour_start.saturating_add(i64::from(offset.seconds()));
    if observed_at > candidate.saturating_sub(BOUNDARY_TOLERANCE_SECS) {
        candidate.saturating_add(HOUR_SECS)
    } else {
        candidate
    }
}

/// Seconds from `now` until the clock next reads `offset` within the hour.
pub fn seconds_until_offset(offset: DespawnOffset, now: i64) -> i64 {
    let offset = i64::from(offset.seconds());
    let into_hour = now.rem_euclid(HOUR_SECS);
    if into_hour > offset {
        offset.saturating_add(HOUR_SECS).saturating_sub(into_hour)
    } else {
        offset.saturating_sub(into_hour)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
