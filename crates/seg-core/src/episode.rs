//! Finalized timeline records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::relation::{Anchor, Relation};
use crate::types::{Confidence, DetectorId, EntityId, Subject};

/// Index of an episode in the timeline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(u64);

impl EpisodeId {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Index of an activity in the timeline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(u64);

impl ActivityId {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Why an episode ended other than by a detector transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EpisodeFlags {
    /// Closed at the last observed sample because the input had a gap.
    #[serde(default)]
    pub truncated: bool,
    /// Closed at end-of-stream while still active.
    #[serde(default)]
    pub unterminated: bool,
}

impl EpisodeFlags {
    pub const TRUNCATED: Self = Self {
        truncated: true,
        unterminated: false,
    };

    pub const UNTERMINATED: Self = Self {
        truncated: false,
        unterminated: true,
    };

    /// Whether the end boundary reflects a real transition.
    pub const fn natural_end(self) -> bool {
        !self.truncated && !self.unterminated
    }
}

/// An episode as closed by the aggregator, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedEpisode {
    pub subject: Subject,
    pub relation: Relation,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub flags: EpisodeFlags,
    #[serde(default)]
    pub confidence: Confidence,
    pub detector: DetectorId,
}

/// A finalized, immutable interval labelling one relation for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub subject: Subject,
    pub relation: Relation,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub flags: EpisodeFlags,
    #[serde(default)]
    pub confidence: Confidence,
    pub detector: DetectorId,
    /// The earlier record this one corrects, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<EpisodeId>,
}

impl Episode {
    pub fn from_closed(id: EpisodeId, closed: ClosedEpisode, supersedes: Option<EpisodeId>) -> Self {
        Self {
            id,
            subject: closed.subject,
            relation: closed.relation,
            start: closed.start,
            end: closed.end,
            flags: closed.flags,
            confidence: closed.confidence,
            detector: closed.detector,
            supersedes,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn involves(&self, entity: &EntityId) -> bool {
        self.subject.involves(entity)
    }

    /// Whether the closed interval `[start, end]` intersects `[from, to]`.
    pub fn overlaps_range(&self, from: f64, to: f64) -> bool {
        self.start <= to && self.end >= from
    }

    /// Time of the given boundary, or `None` for an end that was forced by a
    /// gap or end-of-stream.
    pub fn anchor_time(&self, anchor: Anchor) -> Option<f64> {
        match anchor {
            Anchor::Start => Some(self.start),
            Anchor::End => self.flags.natural_end().then_some(self.end),
        }
    }
}

/// A rule match before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMatch {
    pub name: String,
    /// Position of the rule in the rule table.
    pub rule_index: usize,
    pub priority: i32,
    /// Role name to bound entity.
    pub roles: BTreeMap<String, EntityId>,
    /// Contributing episodes, in rule step order.
    pub episodes: Vec<EpisodeId>,
    pub start: f64,
    pub end: f64,
}

/// A named higher-level activity composed from episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub name: String,
    pub rule_index: usize,
    pub priority: i32,
    pub roles: BTreeMap<String, EntityId>,
    pub episodes: Vec<EpisodeId>,
    pub start: f64,
    pub end: f64,
}

impl Activity {
    pub fn from_match(id: ActivityId, found: ActivityMatch) -> Self {
        Self {
            id,
            name: found.name,
            rule_index: found.rule_index,
            priority: found.priority,
            roles: found.roles,
            episodes: found.episodes,
            start: found.start,
            end: found.end,
        }
    }

    pub fn involves(&self, entity: &EntityId) -> bool {
        self.roles.values().any(|bound| bound == entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(flags: EpisodeFlags) -> Episode {
        Episode {
            id: EpisodeId::new(3),
            subject: Subject::Entity(EntityId::new("cup").unwrap()),
            relation: Relation::Motion,
            start: 1.0,
            end: 2.5,
            flags,
            confidence: Confidence::MAX,
            detector: DetectorId::new("motion:cup").unwrap(),
            supersedes: None,
        }
    }

    #[test]
    fn forced_ends_have_no_end_anchor() {
        let natural = episode(EpisodeFlags::default());
        assert_eq!(natural.anchor_time(Anchor::End), Some(2.5));

        for flags in [EpisodeFlags::TRUNCATED, EpisodeFlags::UNTERMINATED] {
            let forced = episode(flags);
            assert_eq!(forced.anchor_time(Anchor::Start), Some(1.0));
            assert_eq!(forced.anchor_time(Anchor::End), None);
        }
    }

    #[test]
    fn overlaps_range_is_inclusive() {
        let e = episode(EpisodeFlags::default());
        assert!(e.overlaps_range(2.5, 3.0));
        assert!(e.overlaps_range(0.0, 1.0));
        assert!(!e.overlaps_range(2.6, 3.0));
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(EpisodeId::new(7).to_string(), "e7");
        assert_eq!(ActivityId::new(2).to_string(), "a2");
    }
}
