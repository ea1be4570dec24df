//! Core engine for the episode segmenter.
//!
//! This crate contains the fundamental types and logic for:
//! - Detection: per-relation hysteresis state machines over frame samples
//! - Aggregation: pairing candidate transitions into non-overlapping episodes
//! - Classification: matching episode patterns against a declarative rule table
//! - Timeline: an append-only, queryable store of episodes and activities
//!
//! The crate performs no I/O. Frames come in through [`Segmenter::push_frame`]
//! or any [`FrameSource`]; results come out as a [`TimelineSnapshot`].

mod aggregator;
mod classifier;
pub mod config;
mod detector;
mod engine;
pub mod episode;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod relation;
pub mod rules;
pub mod timeline;
pub mod types;

pub use aggregator::{EpisodeAggregator, Ingested};
pub use classifier::{ActivityClassifier, Classification};
pub use config::{ConfigError, SegmenterConfig};
pub use detector::{CandidateEvent, Detector, DetectorSettings, DetectorState};
pub use engine::{CancelToken, RunSummary, Segmenter, StepReport};
pub use episode::{
    Activity, ActivityId, ActivityMatch, ClosedEpisode, Episode, EpisodeFlags, EpisodeId,
};
pub use error::{Anomaly, AnomalyCounts, FrameError, SegmentError};
pub use frame::{Frame, FrameSource};
pub use geometry::{
    BodyState, PairPredicates, Pose, PredicateProvider, ProximityProvider, Quaternion, Twist, Vec3,
};
pub use relation::{Anchor, EventKind, Relation, UnknownEventKind};
pub use rules::{ActivityRule, RuleStep, default_rules};
pub use timeline::{EntityRecord, EpisodeQuery, TimelineError, TimelineSnapshot, TimelineStore};
pub use types::{
    Confidence, DetectorId, Entity, EntityId, EntityKind, EntityPair, Subject, ValidationError,
};
