use thiserror::Error;

/// Errors that can occur while the locker talks to the database.
///
/// Transient variants are logged and recovered at the call site; only
/// startup-time failures cross the public API boundary (wrapped in
/// [`crate::builder::LockerBuildError`]).
#[derive(Error, Debug)]
pub enum LockerError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing payload: {0}")]
    JsonSerializeError(#[from] serde_json::Error),
}

/// A Result type alias for LockerError.
pub type Result<T> = core::result::Result<T, LockerError>;
