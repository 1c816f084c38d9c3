//! Interfaces to the storage backend and the cache-expiry collaborator.
//!
//! The persistence worker owns exactly one [`StorageSession`] for its whole
//! lifetime. The spawn registry reads its startup state through a
//! [`SnapshotSource`], which is a separate handle so a refresh never touches
//! the worker's open transaction.
//!
//! Session methods return `Send` futures so the worker can run on a
//! multi-threaded runtime. Implementations may simply write `async fn`.

use std::future::Future;

use serde::{Deserialize, Serialize};
use spawnwatch_types::{
    Coordinate, DespawnOffset, Observation, PointOfInterest, SpawnId, StructureSighting,
};

/// Errors raised by the storage layer.
///
/// Any of these during event handling makes the worker roll back the open
/// transaction and move on to the next event.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend rejected or failed an operation.
    #[error("{operation} failed: {message}")]
    Backend {
        /// Name of the failing operation.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The session was already closed.
    #[error("storage session is closed")]
    Closed,
}

impl StorageError {
    /// Build a [`StorageError::Backend`] from any displayable error.
    pub fn backend(operation: &'static str, error: impl core::fmt::Display) -> Self {
        Self::Backend {
            operation,
            message: error.to_string(),
        }
    }
}

/// Errors raised by cache-expiry maintenance.
#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    /// Maintenance could not complete.
    #[error("cache maintenance failed: {0}")]
    Failed(String),
}

/// A spawn point row as written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnPointRecord {
    /// Spawn point identifier.
    pub spawn_id: SpawnId,
    /// Location of the spawn point.
    pub position: Coordinate,
    /// Hour-relative despawn offset.
    pub despawn_offset: DespawnOffset,
    /// Ground altitude in meters.
    pub altitude: f64,
}

/// Everything the spawn registry loads from storage on refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// All known spawn points with their current offsets.
    pub spawn_points: Vec<SpawnPointRecord>,
    /// Positions of persisted mystery sightings.
    pub mysteries: Vec<Coordinate>,
    /// Persisted altitudes.
    pub altitudes: Vec<(Coordinate, f64)>,
}

/// A transactional write session.
///
/// Writes accumulate in an open transaction until [`commit`] or
/// [`rollback`]. After [`close`] every call fails with
/// [`StorageError::Closed`].
///
/// [`commit`]: StorageSession::commit
/// [`rollback`]: StorageSession::rollback
/// [`close`]: StorageSession::close
pub trait StorageSession: Send {
    /// Insert a valid entity sighting.
    fn insert_observation(
        &mut self,
        record: &Observation,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert a sighting whose despawn timing is unknown.
    fn insert_mystery(
        &mut self,
        record: &Observation,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert a structure sighting.
    fn insert_structure_sighting(
        &mut self,
        record: &StructureSighting,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert a point of interest.
    fn insert_point_of_interest(
        &mut self,
        record: &PointOfInterest,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert or update a spawn point.
    fn upsert_spawn_point(
        &mut self,
        record: &SpawnPointRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Commit the open transaction.
    fn commit(&mut self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Discard the open transaction.
    fn rollback(&mut self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Release the session. Uncommitted writes are discarded.
    fn close(&mut self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Read access to the state the spawn registry is rebuilt from.
pub trait SnapshotSource: Sync {
    /// Load spawn offsets, mystery points and altitudes.
    fn load_spawn_snapshot(
        &self,
    ) -> impl Future<Output = Result<RegistrySnapshot, StorageError>> + Send;
}

/// Expires stale entries from caches that sit in front of storage.
///
/// Must be idempotent. The worker calls it when asked to, between events.
pub trait CacheExpiry: Send + Sync {
    /// Remove expired entries. Returns the number removed.
    fn expire_stale_entries(&self) -> Result<usize, MaintenanceError>;
}
