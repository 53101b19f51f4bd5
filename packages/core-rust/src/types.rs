//! Home records, owner identity, and the upstream location tuple.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseOwnerIdError, ValidationError};

const HYPHENATED_LEN: usize = 36;

/// Stable identity of a home owner (a player's UUID, never a display name).
///
/// Serializes as the canonical hyphenated UUID string so it can be used
/// directly as a map key in text formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Generates a fresh random identifier. Intended for tests and tooling.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for OwnerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for OwnerId {
    type Err = ParseOwnerIdError;

    /// Parses the hyphenated form only; simple, braced and URN forms are
    /// rejected so that a persisted key round-trips unchanged.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HYPHENATED_LEN {
            return Err(ParseOwnerIdError(s.to_string()));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|_| ParseOwnerIdError(s.to_string()))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// One saved home location.
///
/// Immutable value with no identity of its own; it is only meaningful when
/// keyed by an [`OwnerId`]. Angles are stored as given, without wraparound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Home {
    world: String,
    x: f64,
    y: f64,
    z: f64,
    yaw: f32,
    pitch: f32,
}

impl Home {
    /// Builds a home without validation.
    ///
    /// Storage backends use this when decoding persisted records; upstream
    /// callers should go through [`Location::to_home`] instead.
    #[must_use]
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64, yaw: f32, pitch: f32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw,
            pitch,
        }
    }

    #[must_use]
    pub fn world(&self) -> &str {
        &self.world
    }

    #[must_use]
    pub fn x(&self) -> f64 {
        self.x
    }

    #[must_use]
    pub fn y(&self) -> f64 {
        self.y
    }

    #[must_use]
    pub fn z(&self) -> f64 {
        self.z
    }

    #[must_use]
    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    #[must_use]
    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Converts back into the upstream location tuple.
    #[must_use]
    pub fn to_location(&self) -> Location {
        Location {
            world: self.world.clone(),
            x: self.x,
            y: self.y,
            z: self.z,
            yaw: self.yaw,
            pitch: self.pitch,
        }
    }
}

/// Position and orientation as exchanged with the host game runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Identifier of the world the position belongs to.
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Horizontal rotation in degrees.
    pub yaw: f32,
    /// Vertical rotation in degrees.
    pub pitch: f32,
}

impl Location {
    #[must_use]
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64, yaw: f32, pitch: f32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw,
            pitch,
        }
    }

    /// Checks the structural shape of the location: a non-empty world and
    /// finite coordinates and angles. World resolution is the caller's job.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.world.trim().is_empty() {
            return Err(ValidationError::EmptyWorld);
        }
        let axes = [("x", self.x), ("y", self.y), ("z", self.z)];
        for (axis, value) in axes {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteCoordinate(axis));
            }
        }
        if !self.yaw.is_finite() {
            return Err(ValidationError::NonFiniteCoordinate("yaw"));
        }
        if !self.pitch.is_finite() {
            return Err(ValidationError::NonFiniteCoordinate("pitch"));
        }
        Ok(())
    }

    /// Validates and converts into a [`Home`] record.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when [`Location::validate`] fails.
    pub fn to_home(&self) -> Result<Home, ValidationError> {
        self.validate()?;
        Ok(Home::new(
            self.world.clone(),
            self.x,
            self.y,
            self.z,
            self.yaw,
            self.pitch,
        ))
    }
}
