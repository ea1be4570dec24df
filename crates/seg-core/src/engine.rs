//! The push-driven segmentation engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::{EpisodeAggregator, Ingested};
use crate::classifier::ActivityClassifier;
use crate::config::SegmenterConfig;
use crate::detector::{CandidateEvent, Detector, DetectorSettings};
use crate::episode::{ActivityId, ClosedEpisode, EpisodeId};
use crate::error::{Anomaly, AnomalyCounts, SegmentError};
use crate::frame::{Frame, FrameSource};
use crate::geometry::PredicateProvider;
use crate::relation::Relation;
use crate::timeline::{TimelineSnapshot, TimelineStore};
use crate::types::{Entity, EntityId, EntityKind, EntityPair, Subject};

/// Stops [`Segmenter::run`] from consuming further frames.
///
/// Clones share one flag, so a token can be handed to another thread or a
/// signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one frame produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub timestamp: f64,
    /// Episodes finalized by this frame, in finalization order.
    pub episodes: Vec<EpisodeId>,
    pub activities: Vec<ActivityId>,
    pub anomalies: Vec<Anomaly>,
    /// Entities seen for the first time.
    pub new_entities: Vec<EntityId>,
}

impl StepReport {
    fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

/// Totals for a [`Segmenter::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub frames: usize,
    pub episodes: usize,
    pub activities: usize,
    pub anomalies: AnomalyCounts,
    /// Whether the run stopped on a cancel request rather than end of input.
    pub cancelled: bool,
}

/// Turns a stream of frames into a timeline of episodes and activities.
///
/// Detectors are created on demand: motion and rotation for every body,
/// contact and support for every pair with predicates.
pub struct Segmenter {
    config: SegmenterConfig,
    settings: DetectorSettings,
    detectors: Vec<Detector>,
    slots: BTreeMap<(Subject, Relation), usize>,
    aggregator: EpisodeAggregator,
    classifier: ActivityClassifier,
    timeline: TimelineStore,
    provider: Option<Arc<dyn PredicateProvider>>,
    declared: BTreeMap<EntityId, EntityKind>,
    seen: BTreeSet<EntityId>,
    last_timestamp: Option<f64>,
    accepted: usize,
    newest_end: f64,
    anomalies: AnomalyCounts,
    halted: bool,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Result<Self, SegmentError> {
        Self::with_timeline(config, TimelineStore::new())
    }

    /// Builds an engine writing into an existing store handle.
    pub fn with_timeline(config: SegmenterConfig, timeline: TimelineStore) -> Result<Self, SegmentError> {
        config.validate()?;
        debug!(
            rules = config.activity_rules.len(),
            lookback = config.lookback_window(),
            "Creating segmenter"
        );
        Ok(Self {
            settings: DetectorSettings::from(&config),
            detectors: Vec::new(),
            slots: BTreeMap::new(),
            aggregator: EpisodeAggregator::new(config.concurrent_relations.clone()),
            classifier: ActivityClassifier::new(&config),
            timeline,
            provider: None,
            declared: BTreeMap::new(),
            seen: BTreeSet::new(),
            last_timestamp: None,
            accepted: 0,
            newest_end: f64::NEG_INFINITY,
            anomalies: AnomalyCounts::default(),
            halted: false,
            config,
        })
    }

    /// Fills missing pair predicates for every pair of bodies in each frame.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn PredicateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Declares an entity's kind ahead of the first frame that mentions it.
    pub fn declare_entity(&mut self, entity: Entity) {
        self.classifier.register_entity(&entity);
        self.declared.insert(entity.id, entity.kind);
    }

    pub const fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// A shared handle to the store; readers may query it during a run.
    pub fn timeline(&self) -> TimelineStore {
        self.timeline.clone()
    }

    pub const fn anomalies(&self) -> AnomalyCounts {
        self.anomalies
    }

    pub fn detector_count(&self) -> usize {
        self.detectors.len()
    }

    pub fn open_episodes(&self) -> usize {
        self.aggregator.open_count()
    }

    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// Frames that passed validation and advanced the clock. Malformed and
    /// out-of-order frames are not counted.
    pub const fn frames_accepted(&self) -> usize {
        self.accepted
    }

    /// Processes one frame.
    ///
    /// A malformed frame is fatal: it returns [`SegmentError::Frame`] and
    /// every later call returns [`SegmentError::Halted`]. A frame whose
    /// timestamp does not increase is dropped and reported as an anomaly.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<StepReport, SegmentError> {
        if self.halted {
            return Err(SegmentError::Halted);
        }
        if let Err(err) = frame.validate() {
            self.halted = true;
            error!(error = %err, "Rejecting malformed frame, halting");
            return Err(err.into());
        }

        let t = frame.timestamp;
        let mut report = StepReport::new(t);
        if let Some(last) = self.last_timestamp {
            if t <= last {
                warn!(timestamp = t, last_committed = last, "Dropping out-of-order frame");
                self.record(
                    &mut report,
                    Anomaly::OutOfOrderInput {
                        target: "frame".to_string(),
                        timestamp: t,
                        last_committed: last,
                    },
                );
                return Ok(report);
            }
        }
        self.last_timestamp = Some(t);
        self.accepted += 1;

        let filled;
        let frame = match &self.provider {
            Some(provider) => {
                let mut copy = frame.clone();
                copy.apply_provider(provider.as_ref(), &body_pairs(frame));
                filled = copy;
                &filled
            }
            None => frame,
        };
        self.discover(frame, &mut report);

        let mut candidates: Vec<CandidateEvent> = self
            .detectors
            .par_iter_mut()
            .flat_map_iter(|detector| {
                let mut out = Vec::with_capacity(2);
                out.extend(detector.expire(t));
                out.extend(detector.step(frame));
                out
            })
            .collect();
        candidates.sort_by(merge_order);

        let mut closed = Vec::new();
        for candidate in &candidates {
            if candidate.flags.truncated {
                let last_seen = candidate.timestamp();
                warn!(
                    subject = %candidate.subject,
                    relation = %candidate.relation(),
                    last_seen,
                    resumed_at = t,
                    "Gap exceeded tolerance, truncating episode"
                );
                self.record(
                    &mut report,
                    Anomaly::GapExceeded {
                        subject: candidate.subject.clone(),
                        relation: candidate.relation(),
                        last_seen,
                        resumed_at: t,
                    },
                );
            }
            self.ingest(candidate, &mut closed, &mut report);
        }

        let floor = self
            .detectors
            .iter()
            .filter_map(Detector::pending_start)
            .chain(self.aggregator.earliest_open_start())
            .fold(t, f64::min);
        self.commit(closed, floor, &mut report)?;
        Ok(report)
    }

    /// Pushes frames from `source` until it ends or `cancel` is set.
    ///
    /// A source error is fatal, like a malformed frame. Call
    /// [`Self::finalize`] afterwards in every case to flush open episodes.
    pub fn run<S: FrameSource>(&mut self, mut source: S, cancel: &CancelToken) -> Result<RunSummary, SegmentError> {
        let mut summary = RunSummary::default();
        while !cancel.is_cancelled() {
            let Some(item) = source.next() else {
                break;
            };
            let frame = match item {
                Ok(frame) => frame,
                Err(err) => {
                    self.halted = true;
                    error!(error = %err, frames = summary.frames, "Frame source failed, halting");
                    return Err(err.into());
                }
            };
            let report = self.push_frame(&frame)?;
            summary.frames += 1;
            summary.episodes += report.episodes.len();
            summary.activities += report.activities.len();
        }
        summary.cancelled = cancel.is_cancelled();
        if summary.cancelled {
            info!(frames = summary.frames, "Segmentation cancelled");
        }
        summary.anomalies = self.anomalies;
        Ok(summary)
    }

    /// Closes every open episode as unterminated and returns the timeline.
    ///
    /// Works after a fatal error too, flushing what was committed. The engine
    /// accepts no frames afterwards.
    pub fn finalize(&mut self) -> Result<TimelineSnapshot, SegmentError> {
        let last = self
            .last_timestamp
            .or_else(|| self.aggregator.last_observed())
            .unwrap_or(0.0);
        let mut report = StepReport::new(last);

        let mut flushed: Vec<CandidateEvent> =
            self.detectors.iter_mut().filter_map(Detector::flush).collect();
        flushed.sort_by(merge_order);

        let mut closed = Vec::new();
        for candidate in &flushed {
            self.ingest(candidate, &mut closed, &mut report);
        }
        closed.extend(self.aggregator.finalize(last));
        self.commit(closed, f64::INFINITY, &mut report)?;
        self.halted = true;

        let mut snapshot = self.timeline.finalize();
        snapshot.anomalies = self.anomalies;
        info!(
            entities = snapshot.entities.len(),
            episodes = snapshot.episodes.len(),
            activities = snapshot.activities.len(),
            anomalies = self.anomalies.total(),
            "Segmentation finalized"
        );
        Ok(snapshot)
    }

    fn record(&mut self, report: &mut StepReport, anomaly: Anomaly) {
        self.anomalies.record(&anomaly);
        report.anomalies.push(anomaly);
    }

    fn ingest(&mut self, candidate: &CandidateEvent, closed: &mut Vec<ClosedEpisode>, report: &mut StepReport) {
        match self.aggregator.ingest(candidate) {
            Ok(Ingested::Closed(episode)) => closed.push(episode),
            Ok(Ingested::Opened | Ingested::Ignored) => {}
            Err(anomaly) => self.record(report, anomaly),
        }
    }

    /// Appends closed episodes and classifies them in finalization order.
    ///
    /// `floor` bounds the start of any episode finalized by a later frame.
    fn commit(
        &mut self,
        closed: Vec<ClosedEpisode>,
        floor: f64,
        report: &mut StepReport,
    ) -> Result<(), SegmentError> {
        let mut episodes = Vec::with_capacity(closed.len());
        for episode in closed {
            let id = self.timeline.append_episode(episode)?;
            if let Some(episode) = self.timeline.episode(id) {
                debug!(
                    episode = %id,
                    subject = %episode.subject,
                    relation = %episode.relation,
                    start = episode.start,
                    end = episode.end,
                    "Episode finalized"
                );
                episodes.push(episode);
            }
            report.episodes.push(id);
        }

        // earliest start among the rest of the batch, or the floor
        let mut floors = vec![floor; episodes.len() + 1];
        for (i, episode) in episodes.iter().enumerate().rev() {
            floors[i] = floors[i + 1].min(episode.start);
        }

        for (i, episode) in episodes.iter().enumerate() {
            self.newest_end = self.newest_end.max(episode.end);
            let watermark = floors[i + 1].min(self.newest_end);
            let result = self.classifier.observe(episode, watermark);
            for anomaly in result.anomalies {
                self.record(report, anomaly);
            }
            for found in result.activities {
                info!(
                    activity = %found.name,
                    roles = ?found.roles,
                    start = found.start,
                    end = found.end,
                    "Activity recognized"
                );
                report.activities.push(self.timeline.append_activity(found)?);
            }
        }
        Ok(())
    }

    fn discover(&mut self, frame: &Frame, report: &mut StepReport) {
        for id in frame.entity_ids() {
            if !self.seen.insert(id.clone()) {
                continue;
            }
            let declared = self.declared.get(id).copied();
            let entity = Entity::new(id.clone(), declared.unwrap_or_default());
            if declared.is_some() {
                debug!(entity = %id, timestamp = frame.timestamp, "Declared entity first seen");
            } else {
                info!(entity = %id, kind = %entity.kind, timestamp = frame.timestamp, "New entity");
            }
            self.timeline.register_entity(&entity, frame.timestamp);
            self.classifier.register_entity(&entity);
            report.new_entities.push(id.clone());
        }

        for id in frame.bodies.keys() {
            for relation in [Relation::Motion, Relation::Rotation] {
                self.ensure_detector(Subject::Entity(id.clone()), relation);
            }
        }
        for pair in frame.pairs.keys() {
            for relation in [Relation::Contact, Relation::Support] {
                self.ensure_detector(Subject::Pair(pair.clone()).slot_for(relation), relation);
            }
        }
    }

    fn ensure_detector(&mut self, subject: Subject, relation: Relation) {
        let key = (subject, relation);
        if self.slots.contains_key(&key) {
            return;
        }
        let detector = Detector::new(key.0.clone(), relation, self.settings);
        debug!(detector = %detector.id(), "Creating detector");
        self.slots.insert(key, self.detectors.len());
        self.detectors.push(detector);
    }
}

/// Candidates are applied by boundary time, then subject, then relation,
/// closes before opens.
fn merge_order(a: &CandidateEvent, b: &CandidateEvent) -> std::cmp::Ordering {
    a.timestamp()
        .total_cmp(&b.timestamp())
        .then_with(|| a.subject.cmp(&b.subject))
        .then_with(|| a.relation().cmp(&b.relation()))
        .then_with(|| a.is_open().cmp(&b.is_open()))
}

/// Every pair of bodies in the frame, in id order.
fn body_pairs(frame: &Frame) -> Vec<EntityPair> {
    let ids: Vec<&EntityId> = frame.bodies.keys().collect();
    let mut pairs = Vec::new();
    for (i, first) in ids.iter().enumerate() {
        for second in &ids[i + 1..] {
            if let Ok(pair) = EntityPair::new((*first).clone(), (*second).clone()) {
                pairs.push(pair);
            }
        }
    }
    pairs
}
