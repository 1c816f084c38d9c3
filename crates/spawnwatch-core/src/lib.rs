//! Spawn registry and persistence pipeline for the spawnwatch scanner.
//!
//! Producers push [`Event`]s onto an [`EventQueue`]. A single
//! [`PersistenceWorker`] drains the queue into a [`StorageSession`] and
//! teaches the shared [`SpawnRegistry`] every despawn offset it persists.
//! Producers query the registry directly for despawn predictions, mystery
//! points and cached altitudes.
//!
//! # Modules
//!
//! - [`altitude`] -- Elevation lookups over HTTP or from a fixed table
//! - [`config`] -- YAML configuration with environment overrides
//! - [`geo`] -- Coordinate rounding for cache keys and survey grids
//! - [`memory`] -- In-memory storage backend with failure injection
//! - [`queue`] -- Unbounded multi-producer event queue
//! - [`registry`] -- Spawn offsets, despawn prediction, mystery points
//! - [`storage`] -- Storage session, snapshot and cache-expiry interfaces
//! - [`worker`] -- The persistence worker and its control flags
//!
//! [`Event`]: spawnwatch_types::Event

pub mod altitude;
pub mod config;
pub mod geo;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod worker;

pub use altitude::{AltitudeSource, HttpAltitudeResolver, LookupError, StaticAltitudes};
pub use config::{ConfigError, SpawnwatchConfig};
pub use geo::{RoundedPoint, round_coordinate};
pub use memory::{MemorySession, MemoryStore};
pub use queue::{EventQueue, EventReceiver, QueueClosed, event_queue};
pub use registry::{RefreshError, RefreshSummary, SpawnRegistry};
pub use storage::{
    CacheExpiry, MaintenanceError, RegistrySnapshot, SnapshotSource, SpawnPointRecord,
    StorageError, StorageSession,
};
pub use worker::{
    ExitReason, PersistenceWorker, WorkerControl, WorkerError, WorkerHandle, WorkerReport,
    WorkerState,
};
