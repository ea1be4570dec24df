//! Per-relation hysteresis state machines.
//!
//! One [`Detector`] watches one relation for one subject. Each frame it reads
//! a boolean signal, filters it through hysteresis and a minimum duration,
//! and emits a [`CandidateEvent`] when an episode opens or closes.

use serde::{Deserialize, Serialize};

use crate::config::SegmenterConfig;
use crate::episode::EpisodeFlags;
use crate::frame::Frame;
use crate::geometry::{Pose, estimate_twist};
use crate::relation::{EventKind, Relation};
use crate::types::{Confidence, DetectorId, Subject};

/// A boundary proposed by a detector, not yet accepted into the timeline.
///
/// Opening candidates carry only `start`. Closing candidates repeat the
/// episode's `start` and set `end` to the last timestamp the signal held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub kind: EventKind,
    pub subject: Subject,
    pub start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default)]
    pub flags: EpisodeFlags,
    #[serde(default)]
    pub confidence: Confidence,
    pub detector: DetectorId,
}

impl CandidateEvent {
    pub const fn relation(&self) -> Relation {
        self.kind.relation()
    }

    pub const fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Time of the boundary this candidate reports.
    pub fn timestamp(&self) -> f64 {
        self.end.unwrap_or(self.start)
    }
}

/// Detector thresholds, copied out of [`SegmenterConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub min_event_duration: f64,
    pub hysteresis_frames: u32,
    pub gap_tolerance: f64,
    pub velocity_threshold: f64,
    pub angular_velocity_threshold: f64,
}

impl From<&SegmenterConfig> for DetectorSettings {
    fn from(config: &SegmenterConfig) -> Self {
        Self {
            min_event_duration: config.min_event_duration,
            hysteresis_frames: config.hysteresis_frames.max(1),
            gap_tolerance: config.gap_tolerance,
            velocity_threshold: config.velocity_threshold,
            angular_velocity_threshold: config.angular_velocity_threshold,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::from(&SegmenterConfig::default())
    }
}

/// Sample tallies for an open episode, used for its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Run {
    since: f64,
    last_true: f64,
    samples: u32,
    positives: u32,
    /// Negative samples after `last_true`, not yet counted.
    pending: u32,
}

impl Run {
    const fn new(since: f64) -> Self {
        Self {
            since,
            last_true: since,
            samples: 1,
            positives: 1,
            pending: 0,
        }
    }

    fn record(&mut self, timestamp: f64, signal: bool) {
        if signal {
            self.samples += self.pending + 1;
            self.positives += 1;
            self.pending = 0;
            self.last_true = timestamp;
        } else {
            self.pending += 1;
        }
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "ratio of two counts is within [0, 1]"
    )]
    fn confidence(&self) -> Confidence {
        Confidence::clamped((f64::from(self.positives) / f64::from(self.samples.max(1))) as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorState {
    Idle,
    /// Signal on, not yet confirmed.
    Rising { since: f64, frames: u32 },
    Active,
    /// Signal off, not yet confirmed.
    Falling { frames: u32 },
}

#[derive(Debug, Clone)]
pub struct Detector {
    id: DetectorId,
    subject: Subject,
    relation: Relation,
    settings: DetectorSettings,
    state: DetectorState,
    run: Option<Run>,
    last_seen: Option<f64>,
    previous_pose: Option<(f64, Pose)>,
}

impl Detector {
    pub fn new(subject: Subject, relation: Relation, settings: DetectorSettings) -> Self {
        Self {
            id: DetectorId::for_slot(relation, &subject),
            subject,
            relation,
            settings,
            state: DetectorState::Idle,
            run: None,
            last_seen: None,
            previous_pose: None,
        }
    }

    pub const fn id(&self) -> &DetectorId {
        &self.id
    }

    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    pub const fn relation(&self) -> Relation {
        self.relation
    }

    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Start of the episode this detector is building, confirmed or not.
    ///
    /// No episode it finalizes later can start before this.
    pub fn pending_start(&self) -> Option<f64> {
        match self.state {
            DetectorState::Idle => None,
            DetectorState::Rising { since, .. } => Some(since),
            DetectorState::Active | DetectorState::Falling { .. } => self.run.map(|r| r.since),
        }
    }

    /// Truncates an open episode when the subject has been silent for longer
    /// than the gap tolerance as of `now`.
    pub fn expire(&mut self, now: f64) -> Option<CandidateEvent> {
        let last_seen = self.last_seen?;
        if now - last_seen <= self.settings.gap_tolerance {
            return None;
        }
        self.previous_pose = None;
        self.last_seen = None;
        match self.state {
            DetectorState::Idle => None,
            DetectorState::Rising { .. } => {
                self.state = DetectorState::Idle;
                None
            }
            DetectorState::Active | DetectorState::Falling { .. } => {
                self.close(EpisodeFlags::TRUNCATED)
            }
        }
    }

    /// Advances the state machine with one frame.
    ///
    /// Frames that carry no sample for this subject leave the state untouched.
    pub fn step(&mut self, frame: &Frame) -> Option<CandidateEvent> {
        let signal = self.sample(frame)?;
        let t = frame.timestamp;
        self.last_seen = Some(t);
        let needed = self.settings.hysteresis_frames.max(1);

        match self.state {
            DetectorState::Idle => {
                if !signal {
                    return None;
                }
                self.state = DetectorState::Rising { since: t, frames: 1 };
                self.confirm(t)
            }
            DetectorState::Rising { since, frames } => {
                if signal {
                    self.state = DetectorState::Rising {
                        since,
                        frames: frames + 1,
                    };
                    self.confirm(t)
                } else {
                    self.state = DetectorState::Idle;
                    None
                }
            }
            DetectorState::Active => {
                if let Some(run) = self.run.as_mut() {
                    run.record(t, signal);
                }
                if signal {
                    return None;
                }
                if needed <= 1 {
                    return self.close(EpisodeFlags::default());
                }
                self.state = DetectorState::Falling { frames: 1 };
                None
            }
            DetectorState::Falling { frames } => {
                if let Some(run) = self.run.as_mut() {
                    run.record(t, signal);
                }
                if signal {
                    self.state = DetectorState::Active;
                    return None;
                }
                if frames + 1 >= needed {
                    return self.close(EpisodeFlags::default());
                }
                self.state = DetectorState::Falling { frames: frames + 1 };
                None
            }
        }
    }

    /// Closes an open episode at end-of-stream. Unconfirmed runs are dropped.
    pub fn flush(&mut self) -> Option<CandidateEvent> {
        match self.state {
            DetectorState::Idle => None,
            DetectorState::Rising { .. } => {
                self.state = DetectorState::Idle;
                None
            }
            DetectorState::Active | DetectorState::Falling { .. } => {
                self.close(EpisodeFlags::UNTERMINATED)
            }
        }
    }

    fn confirm(&mut self, t: f64) -> Option<CandidateEvent> {
        let DetectorState::Rising { since, frames } = self.state else {
            return None;
        };
        if frames < self.settings.hysteresis_frames.max(1)
            || t - since < self.settings.min_event_duration
        {
            return None;
        }

        let mut run = Run::new(since);
        for _ in 1..frames {
            run.record(t, true);
        }
        self.run = Some(run);
        self.state = DetectorState::Active;

        Some(CandidateEvent {
            kind: self.relation.start_kind(),
            subject: self.subject.clone(),
            start: since,
            end: None,
            flags: EpisodeFlags::default(),
            confidence: Confidence::MAX,
            detector: self.id.clone(),
        })
    }

    fn close(&mut self, flags: EpisodeFlags) -> Option<CandidateEvent> {
        self.state = DetectorState::Idle;
        let run = self.run.take()?;
        Some(CandidateEvent {
            kind: self.relation.end_kind(),
            subject: self.subject.clone(),
            start: run.since,
            end: Some(run.last_true),
            flags,
            confidence: run.confidence(),
            detector: self.id.clone(),
        })
    }

    fn sample(&mut self, frame: &Frame) -> Option<bool> {
        match (&self.subject, self.relation) {
            (Subject::Pair(pair), Relation::Contact) => frame.contact(pair),
            (Subject::Pair(pair), Relation::Support) => {
                frame.pair(pair).map(|p| p.support.unwrap_or(false))
            }
            (Subject::Entity(id), Relation::Motion | Relation::Rotation) => {
                let body = frame.body(id)?;
                let previous = self.previous_pose.replace((frame.timestamp, body.pose));
                let twist = body.twist.or_else(|| {
                    let (at, pose) = previous?;
                    estimate_twist(&pose, &body.pose, frame.timestamp - at)
                });
                let Some(twist) = twist else {
                    return Some(false);
                };
                Some(if self.relation == Relation::Motion {
                    twist.linear.norm() > self.settings.velocity_threshold
                } else {
                    twist.angular.norm() > self.settings.angular_velocity_threshold
                })
            }
            _ => None,
        }
    }
}
