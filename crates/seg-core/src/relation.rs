//! Relation and event-kind vocabulary as the single source of truth for their names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monitored predicate over one entity or a pair of entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Two bodies touch.
    Contact,
    /// The first body of a pair rests on the second.
    Support,
    /// A body translates faster than the velocity threshold.
    Motion,
    /// A body rotates faster than the angular velocity threshold.
    Rotation,
}

impl Relation {
    pub const ALL: [Self; 4] = [Self::Contact, Self::Support, Self::Motion, Self::Rotation];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Support => "support",
            Self::Motion => "motion",
            Self::Rotation => "rotation",
        }
    }

    /// Whether the relation is observed on entity pairs rather than single bodies.
    #[must_use]
    pub const fn is_pairwise(&self) -> bool {
        matches!(self, Self::Contact | Self::Support)
    }

    /// Whether swapping the two entities of a pair leaves the relation unchanged.
    #[must_use]
    pub const fn is_symmetric(&self) -> bool {
        matches!(self, Self::Contact)
    }

    #[must_use]
    pub const fn start_kind(&self) -> EventKind {
        match self {
            Self::Contact => EventKind::ContactStart,
            Self::Support => EventKind::SupportStart,
            Self::Motion => EventKind::MotionStart,
            Self::Rotation => EventKind::RotationStart,
        }
    }

    #[must_use]
    pub const fn end_kind(&self) -> EventKind {
        match self {
            Self::Contact => EventKind::ContactEnd,
            Self::Support => EventKind::SupportEnd,
            Self::Motion => EventKind::MotionStop,
            Self::Rotation => EventKind::RotationStop,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Relation {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "support" => Ok(Self::Support),
            "motion" | "translation" => Ok(Self::Motion),
            "rotation" => Ok(Self::Rotation),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Which boundary of an episode an event kind refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Anchor {
    Start,
    End,
}

/// Transition kinds emitted by detectors and referenced by activity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ContactStart,
    ContactEnd,
    SupportStart,
    SupportEnd,
    MotionStart,
    MotionStop,
    RotationStart,
    RotationStop,
}

impl EventKind {
    #[must_use]
    pub const fn relation(&self) -> Relation {
        match self {
            Self::ContactStart | Self::ContactEnd => Relation::Contact,
            Self::SupportStart | Self::SupportEnd => Relation::Support,
            Self::MotionStart | Self::MotionStop => Relation::Motion,
            Self::RotationStart | Self::RotationStop => Relation::Rotation,
        }
    }

    #[must_use]
    pub const fn anchor(&self) -> Anchor {
        match self {
            Self::ContactStart | Self::SupportStart | Self::MotionStart | Self::RotationStart => {
                Anchor::Start
            }
            Self::ContactEnd | Self::SupportEnd | Self::MotionStop | Self::RotationStop => {
                Anchor::End
            }
        }
    }

    #[must_use]
    pub const fn is_start(&self) -> bool {
        matches!(self.anchor(), Anchor::Start)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ContactStart => "contact_start",
            Self::ContactEnd => "contact_end",
            Self::SupportStart => "support_start",
            Self::SupportEnd => "support_end",
            Self::MotionStart => "motion_start",
            Self::MotionStop => "motion_stop",
            Self::RotationStart => "rotation_start",
            Self::RotationStop => "rotation_stop",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact_start" => Ok(Self::ContactStart),
            "contact_end" | "loss_of_contact" => Ok(Self::ContactEnd),
            "support_start" => Ok(Self::SupportStart),
            "support_end" | "loss_of_surface" => Ok(Self::SupportEnd),
            "motion_start" | "translation" => Ok(Self::MotionStart),
            "motion_stop" | "stop_translation" => Ok(Self::MotionStop),
            "rotation_start" | "rotation" => Ok(Self::RotationStart),
            "rotation_stop" | "stop_rotation" => Ok(Self::RotationStop),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown relation or event kind strings.
#[derive(Debug, Clone)]
pub struct UnknownEventKind(String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind: {}", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}
