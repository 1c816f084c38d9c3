//! Shared type definitions for the spawnwatch scanner core.
//!
//! Producers (the scanning layer) build these values and hand them to the
//! persistence pipeline in `spawnwatch-core`. Everything here is plain data:
//! no I/O, no locking.
//!
//! # Modules
//!
//! - [`ids`] -- Integer identifier newtypes for spawn points and encounters
//! - [`coords`] -- Raw latitude/longitude pairs
//! - [`spawn`] -- Hour-relative despawn offsets
//! - [`events`] -- Event records carried from producers to the worker

pub mod coords;
pub mod events;
pub mod ids;
pub mod spawn;

pub use coords::Coordinate;
pub use events::{Event, Observation, PointOfInterest, StructureSighting, Validity};
pub use ids::{EncounterId, SpawnId};
pub use spawn::{DespawnOffset, OffsetError, SECONDS_PER_HOUR};
