//! Error taxonomy for the segmentation engine.
//!
//! Only [`SegmentError`] is fatal. Everything in [`Anomaly`] degrades
//! gracefully: the engine drops or truncates, reports the anomaly in the step
//! report, and keeps going.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::episode::EpisodeId;
use crate::relation::Relation;
use crate::timeline::TimelineError;
use crate::types::{EntityId, Subject};

/// A frame is missing or corrupting a field the whole pipeline depends on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame timestamp is not finite: {timestamp}")]
    NonFiniteTimestamp { timestamp: f64 },

    #[error("non-finite pose or velocity for {entity} at t={timestamp}")]
    NonFiniteBody { timestamp: f64, entity: String },

    #[error("non-finite predicate for pair {pair} at t={timestamp}")]
    NonFinitePredicate { timestamp: f64, pair: String },

    /// Raised by frame readers for input they cannot decode.
    #[error("malformed frame {position}: {message}")]
    Malformed { position: String, message: String },
}

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("timeline store rejected a record: {0}")]
    Timeline(#[from] TimelineError),

    /// A previous fatal error stopped the run; only `finalize` is accepted.
    #[error("segmentation halted after a fatal error")]
    Halted,
}

/// Non-fatal conditions surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    /// A frame or candidate arrived with a timestamp earlier than already committed.
    #[error("out-of-order input for {target} at t={timestamp} (last committed t={last_committed})")]
    OutOfOrderInput {
        target: String,
        timestamp: f64,
        last_committed: f64,
    },

    /// A candidate tried to open a relation that is already open for one of its entities.
    #[error("{relation} for {subject} at t={timestamp} overlaps open {open_subject} on {entity}")]
    OverlappingRelation {
        subject: Subject,
        relation: Relation,
        entity: EntityId,
        open_subject: Subject,
        timestamp: f64,
    },

    /// Samples for a subject stopped for longer than the gap tolerance.
    #[error("{relation} for {subject} truncated at t={last_seen} by a gap until t={resumed_at}")]
    GapExceeded {
        subject: Subject,
        relation: Relation,
        last_seen: f64,
        resumed_at: f64,
    },

    /// Two activity matches competed for the same episode boundary.
    #[error("activity {discarded} lost to {kept} over episodes {episodes:?}")]
    AmbiguousActivityMatch {
        kept: String,
        discarded: String,
        episodes: Vec<EpisodeId>,
    },
}

/// Anomaly tallies carried on the finalized timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnomalyCounts {
    pub out_of_order: usize,
    pub overlapping: usize,
    pub gaps: usize,
    pub ambiguous: usize,
}

impl AnomalyCounts {
    pub fn record(&mut self, anomaly: &Anomaly) {
        match anomaly {
            Anomaly::OutOfOrderInput { .. } => self.out_of_order += 1,
            Anomaly::OverlappingRelation { .. } => self.overlapping += 1,
            Anomaly::GapExceeded { .. } => self.gaps += 1,
            Anomaly::AmbiguousActivityMatch { .. } => self.ambiguous += 1,
        }
    }

    pub const fn total(&self) -> usize {
        self.out_of_order + self.overlapping + self.gaps + self.ambiguous
    }
}
