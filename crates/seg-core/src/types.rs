//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relation::Relation;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The confidence value was out of range.
    #[error("confidence must be between 0.0 and 1.0, got {value}")]
    ConfidenceOutOfRange { value: f32 },

    /// A pair was built from the same entity twice.
    #[error("entity pair needs two distinct entities, got {entity} twice")]
    SelfPair { entity: String },

    /// Invalid entity kind value.
    #[error("invalid entity kind: {value}")]
    InvalidEntityKind { value: String },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated entity identifier.
    ///
    /// Entity IDs name tracked bodies (robot links, objects, fixtures) and stay
    /// stable for the lifetime of a segmentation run.
    EntityId, "entity ID"
);

define_string_id!(
    /// A validated detector identifier, e.g. `contact:hand~cup`.
    DetectorId, "detector ID"
);

impl DetectorId {
    /// The identifier of the detector watching `relation` for `subject`.
    pub fn for_slot(relation: Relation, subject: &Subject) -> Self {
        Self(format!("{relation}:{subject}"))
    }
}

/// Semantic role of a tracked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A link of the robot or of a human hand model.
    RobotLink,
    /// A movable object.
    #[default]
    Object,
    /// Static environment: tables, shelves, floors.
    Fixture,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RobotLink => "robot_link",
            Self::Object => "object",
            Self::Fixture => "fixture",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "robot_link" => Ok(Self::RobotLink),
            "object" => Ok(Self::Object),
            "fixture" => Ok(Self::Fixture),
            _ => Err(ValidationError::InvalidEntityKind {
                value: s.to_string(),
            }),
        }
    }
}

/// A tracked body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub kind: EntityKind,
}

impl Entity {
    pub const fn new(id: EntityId, kind: EntityKind) -> Self {
        Self { id, kind }
    }
}

/// An ordered pair of distinct entities.
///
/// Order matters for directional relations: for support, `first` rests on
/// `second`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "(EntityId, EntityId)", into = "(EntityId, EntityId)")]
pub struct EntityPair {
    first: EntityId,
    second: EntityId,
}

impl EntityPair {
    pub fn new(first: EntityId, second: EntityId) -> Result<Self, ValidationError> {
        if first == second {
            return Err(ValidationError::SelfPair {
                entity: first.to_string(),
            });
        }
        Ok(Self { first, second })
    }

    pub const fn first(&self) -> &EntityId {
        &self.first
    }

    pub const fn second(&self) -> &EntityId {
        &self.second
    }

    pub fn contains(&self, entity: &EntityId) -> bool {
        &self.first == entity || &self.second == entity
    }

    /// The same two entities in the opposite order.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            first: self.second.clone(),
            second: self.first.clone(),
        }
    }

    /// The same two entities ordered by id.
    #[must_use]
    pub fn canonical(&self) -> Self {
        if self.first <= self.second {
            self.clone()
        } else {
            self.reversed()
        }
    }
}

impl TryFrom<(EntityId, EntityId)> for EntityPair {
    type Error = ValidationError;

    fn try_from((first, second): (EntityId, EntityId)) -> Result<Self, Self::Error> {
        Self::new(first, second)
    }
}

impl From<EntityPair> for (EntityId, EntityId) {
    fn from(pair: EntityPair) -> Self {
        (pair.first, pair.second)
    }
}

impl fmt::Display for EntityPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.first, self.second)
    }
}

/// What a detector or episode is about: one entity, or a pair of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Entity(EntityId),
    Pair(EntityPair),
}

impl Subject {
    /// Entities taking part, in subject order.
    pub fn entities(&self) -> Vec<&EntityId> {
        match self {
            Self::Entity(id) => vec![id],
            Self::Pair(pair) => vec![pair.first(), pair.second()],
        }
    }

    pub fn involves(&self, entity: &EntityId) -> bool {
        match self {
            Self::Entity(id) => id == entity,
            Self::Pair(pair) => pair.contains(entity),
        }
    }

    /// The subject one detector and one timeline slot use for `relation`.
    ///
    /// Pairs of a symmetric relation are ordered by id, so both orders of the
    /// same two entities share a slot.
    #[must_use]
    pub fn slot_for(&self, relation: Relation) -> Self {
        match self {
            Self::Pair(pair) if relation.is_symmetric() => Self::Pair(pair.canonical()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "{id}"),
            Self::Pair(pair) => write!(f, "{pair}"),
        }
    }
}

/// A confidence score in the range \[0.0, 1.0\].
///
/// Detectors attach it to candidates; it is carried through to episodes.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Confidence(f32);

impl Confidence {
    /// The maximum confidence value (1.0).
    pub const MAX: Self = Self(1.0);

    /// The minimum confidence value (0.0).
    pub const MIN: Self = Self(0.0);

    /// Creates a new confidence value after validation.
    ///
    /// Returns an error if the value is outside \[0.0, 1.0\] or is NaN.
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Creates a confidence value, clamping to \[0.0, 1.0\].
    ///
    /// NaN values become 0.0. Values outside the range are clamped.
    #[must_use]
    pub const fn clamped(value: f32) -> Self {
        if value.is_nan() || value < 0.0 {
            Self(0.0)
        } else if value > 1.0 {
            Self(1.0)
        } else {
            Self(value)
        }
    }

    /// Returns the inner f32 value.
    #[must_use]
    pub const fn value(self) -> f32 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::MAX
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Serialize for Confidence {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f32::deserialize(deserializer)?;
        // Clamp on deserialization to be lenient with external data
        Ok(Self::clamped(value))
    }
}
