use ulid::Ulid;

use crate::model::TimeParseError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed availability data. Fatal to the single computation only.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The requested interval overlaps the given booking.
    #[error("this time slot is no longer available (conflicts with booking {0})")]
    Conflict(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<TimeParseError> for EngineError {
    fn from(e: TimeParseError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}
