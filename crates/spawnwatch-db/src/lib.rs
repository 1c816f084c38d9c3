//! `PostgreSQL` storage backend for the spawnwatch persistence worker.
//!
//! ```text
//! PersistenceWorker
//!     |
//!     +-- writes ------> PgSession (one lazily begun transaction)
//!     |                     |-- sightings / mystery_sightings
//!     |                     |-- structure_sightings / points_of_interest
//!     |                     +-- spawnpoints (upsert)
//!     |
//!     +-- clean caches -> SightingCache (shared by all sessions)
//!
//! SpawnRegistry::refresh --> PgStore (snapshot from the pool)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- Pool configuration, migrations, registry snapshots
//! - [`session`] -- The transactional write session
//! - [`sighting_cache`] -- Encounter de-duplication with expiry
//! - [`error`] -- Setup errors

pub mod error;
pub mod postgres;
pub mod session;
pub mod sighting_cache;

pub use error::DbError;
pub use postgres::{PgStore, PostgresConfig};
pub use session::PgSession;
pub use sighting_cache::{SightingCache, SightingKind};
