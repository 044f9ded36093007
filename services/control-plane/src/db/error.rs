//! Database error types.

use thiserror::Error;

/// Connection and migration errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid database url: {0}")]
    InvalidUrl(#[source] sqlx::Error),

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// The migrations directory is missing or unreadable.
    #[error("cannot read migrations from {dir}: {source}")]
    MigrationSource {
        dir: String,
        #[source]
        source: sqlx::migrate::MigrateError,
    },
}
