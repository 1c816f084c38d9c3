//! In-memory storage backend.
//!
//! [`MemoryStore`] keeps committed rows in process memory and hands out
//! [`MemorySession`]s with real transaction semantics: writes are buffered
//! per session and become visible only on commit. Failures can be injected
//! per encounter or per commit, which makes it the store of choice for
//! exercising the worker without a database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashSet;
use spawnwatch_types::{EncounterId, Observation, PointOfInterest, SpawnId, StructureSighting};
use tokio::sync::Mutex;

use crate::storage::{
    RegistrySnapshot, SnapshotSource, SpawnPointRecord, StorageError, StorageSession,
};

/// Committed contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    /// Valid entity sightings.
    pub observations: Vec<Observation>,
    /// Sightings with unknown despawn timing.
    pub mysteries: Vec<Observation>,
    /// Structure sightings.
    pub structures: Vec<StructureSighting>,
    /// Points of interest.
    pub points_of_interest: Vec<PointOfInterest>,
    /// Spawn points keyed by id.
    pub spawn_points: BTreeMap<SpawnId, SpawnPointRecord>,
    /// Number of successful commits.
    pub commits: u64,
    /// Number of rollbacks.
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Faults {
    failing_encounters: DashSet<EncounterId>,
    failing_commits: AtomicU32,
}

/// Shared in-memory store. Clones refer to the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session on this store.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Copy of the committed tables.
    pub async fn tables(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    /// Make every write of `encounter` fail with a backend error.
    pub fn fail_encounter(&self, encounter: EncounterId) {
        self.faults.failing_encounters.insert(encounter);
    }

    /// Make the next `count` commits fail with a backend error.
    pub fn fail_next_commits(&self, count: u32) {
        self.faults.failing_commits.store(count, Ordering::SeqCst);
    }

    fn check_encounter(&self, record: &Observation) -> Result<(), StorageError> {
        if self.faults.failing_encounters.contains(&record.encounter_id) {
            return Err(StorageError::backend(
                "insert",
                format!("injected failure for encounter {}", record.encounter_id),
            ));
        }
        Ok(())
    }

    fn take_commit_fault(&self) -> bool {
        self.faults
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SnapshotSource for MemoryStore {
    async fn load_spawn_snapshot(&self) -> Result<RegistrySnapshot, StorageError> {
        let tables = self.tables.lock().await;
        Ok(RegistrySnapshot {
            spawn_points: tables.spawn_points.values().copied().collect(),
            mysteries: tables.mysteries.iter().map(|m| m.position).collect(),
            altitudes: tables
                .spawn_points
                .values()
                .map(|s| (s.position, s.altitude))
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Observation(Observation),
    Mystery(Observation),
    Structure(StructureSighting),
    PointOfInterest(PointOfInterest),
    SpawnPoint(SpawnPointRecord),
}

/// A transaction on a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    pending: Vec<PendingWrite>,
    closed: bool,
}

impl MemorySession {
    /// Number of writes waiting for commit.
    pub const fn pending(&self) -> usize {
        self.pending.len()
    }

    fn stage(&mut self, write: PendingWrite) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.pending.push(write);
        Ok(())
    }
}

impl StorageSession for MemorySession {
    async fn insert_observation(&mut self, record: &Observation) -> Result<(), StorageError> {
        self.store.check_encounter(record)?;
        self.stage(PendingWrite::Observation(record.clone()))
    }

    async fn insert_mystery(&mut self, record: &Observation) -> Result<(), StorageError> {
        self.store.check_encounter(record)?;
        self.stage(PendingWrite::Mystery(record.clone()))
    }

    async fn insert_structure_sighting(
        &mut self,
        record: &StructureSighting,
    ) -> Result<(), StorageError> {
        self.stage(PendingWrite::Structure(record.clone()))
    }

    async fn insert_point_of_interest(
        &mut self,
        record: &PointOfInterest,
    ) -> Result<(), StorageError> {
        self.stage(PendingWrite::PointOfInterest(record.clone()))
    }

    async fn upsert_spawn_point(&mut self, record: &SpawnPointRecord) -> Result<(), StorageError> {
        self.stage(PendingWrite::SpawnPoint(*record))
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if self.store.take_commit_fault() {
            return Err(StorageError::backend("commit", "injected commit failure"));
        }

        let mut tables = self.store.tables.lock().await;
        for write in self.pending.drain(..) {
            match write {
                PendingWrite::Observation(o) => tables.observations.push(o),
                PendingWrite::Mystery(o) => tables.mysteries.push(o),
                PendingWrite::Structure(s) => tables.structures.push(s),
                PendingWrite::PointOfInterest(p) => tables.points_of_interest.push(p),
                PendingWrite::SpawnPoint(s) => {
                    tables.spawn_points.insert(s.spawn_id, s);
                }
            }
        }
        tables.commits = tables.commits.saturating_add(1);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.pending.clear();
        let mut tables = self.store.tables.lock().await;
        tables.rollbacks = tables.rollbacks.saturating_add(1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if !self.pending.is_empty() {
            tracing::warn!(
                discarded = self.pending.len(),
                "Closing memory session with uncommitted writes"
            );
        }
        self.pending.clear();
        self.closed = true;
        Ok(())
    }
}
