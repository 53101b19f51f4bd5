use thiserror::Error;

/// Reasons a location is refused by the home store.
///
/// Refusal is a no-op for the store; callers decide how to tell the player.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("location has no world")]
    EmptyWorld,
    #[error("world `{0}` is not loaded")]
    UnknownWorld(String),
    #[error("{0} is not a finite number")]
    NonFiniteCoordinate(&'static str),
    #[error("actor has no current location")]
    MissingLocation,
}

/// A persisted key that is not a hyphenated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is not a hyphenated UUID")]
pub struct ParseOwnerIdError(pub String);
