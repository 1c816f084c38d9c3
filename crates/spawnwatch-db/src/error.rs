//! Error types for the `PostgreSQL` backend.
//!
//! Pool setup and migrations report [`DbError`]. Once the worker owns a
//! session, failures are reported as
//! [`StorageError`](spawnwatch_core::StorageError) so the worker can roll
//! back and carry on.

/// Errors that can occur while setting up the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
