//! Error types for the spot engine.

use thiserror::Error;

/// Errors raised synchronously by the engine itself.
///
/// Remote collaborator failures travel as `anyhow::Error` and are surfaced
/// to the user rather than mapped into this enum.
#[derive(Debug, Error)]
pub enum SpotError {
    #[error("invalid coordinates: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("duration must be a positive number of seconds, got {0}")]
    InvalidDuration(i64),

    #[error("paid spots need a rate")]
    MissingRate,

    #[error("no spot with id {0}")]
    UnknownSpot(String),

    #[error("spot {0} belongs to another user")]
    NotOwned(String),

    #[error("spot {0} has not been confirmed by the server yet")]
    NoRemoteId(String),

    #[error("spot {0} is your own report")]
    OwnSpot(String),

    #[error("spot {0} is already claimed")]
    AlreadyClaimed(String),
}
