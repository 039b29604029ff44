use thiserror::Error;

/// Errors surfaced by trip lifecycle operations.
///
/// `NotFound`, `InvalidState` and `Conflict` are returned synchronously to
/// the triggering admin action and are never retried. Database failures
/// inside a running trip's tick are handled by the runner itself (retry on
/// the next cycle) and only reach this type from the request path.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Trip {0} not found")]
    NotFound(i64),
    #[error("{0}")]
    InvalidState(String),
    #[error("Trip {0} is already being tracked")]
    Conflict(i64),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
