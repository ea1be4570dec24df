//! Pairs opening and closing candidates into closed episodes.
//!
//! The aggregator keeps one open slot per `(subject, relation)`, with both
//! orders of a symmetric pair sharing a slot, and enforces
//! the relation exclusivity rules: a subject never holds two open episodes of
//! the same relation, and an entity holds at most one open episode of a
//! non-concurrent relation across all its partners.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::detector::CandidateEvent;
use crate::episode::{ClosedEpisode, EpisodeFlags};
use crate::error::Anomaly;
use crate::relation::Relation;
use crate::types::{Confidence, DetectorId, EntityId, Subject};

type SlotKey = (Subject, Relation);

#[derive(Debug, Clone, PartialEq)]
struct OpenEpisode {
    start: f64,
    detector: DetectorId,
}

/// What ingesting one candidate did.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Opened,
    Closed(ClosedEpisode),
    /// A close for a slot with no open episode.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeAggregator {
    open: BTreeMap<SlotKey, OpenEpisode>,
    last_committed: HashMap<SlotKey, f64>,
    concurrent: BTreeSet<Relation>,
    last_observed: Option<f64>,
}

impl EpisodeAggregator {
    pub fn new(concurrent: BTreeSet<Relation>) -> Self {
        Self {
            concurrent,
            ..Self::default()
        }
    }

    /// Number of episodes currently open.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, subject: &Subject, relation: Relation) -> bool {
        self.open.contains_key(&(subject.slot_for(relation), relation))
    }

    /// Earliest start among open episodes.
    pub fn earliest_open_start(&self) -> Option<f64> {
        self.open.values().map(|o| o.start).reduce(f64::min)
    }

    /// Latest candidate timestamp seen.
    pub const fn last_observed(&self) -> Option<f64> {
        self.last_observed
    }

    /// Applies one candidate.
    ///
    /// Returns an anomaly, and drops the candidate, when it is out of order for
    /// its slot or would open an overlapping episode.
    pub fn ingest(&mut self, candidate: &CandidateEvent) -> Result<Ingested, Anomaly> {
        let relation = candidate.relation();
        let key = (candidate.subject.slot_for(relation), relation);
        let timestamp = candidate.timestamp();

        if let Some(&last_committed) = self.last_committed.get(&key) {
            if timestamp < last_committed {
                warn!(
                    subject = %candidate.subject,
                    relation = %relation,
                    timestamp,
                    last_committed,
                    "Dropping out-of-order candidate"
                );
                return Err(Anomaly::OutOfOrderInput {
                    target: format!("{relation}:{}", candidate.subject),
                    timestamp,
                    last_committed,
                });
            }
        }
        self.last_observed = Some(self.last_observed.map_or(timestamp, |t| t.max(timestamp)));

        let Some(end) = candidate.end else {
            self.check_overlap(candidate, &key)?;
            self.open.insert(
                key.clone(),
                OpenEpisode {
                    start: candidate.start,
                    detector: candidate.detector.clone(),
                },
            );
            self.last_committed.insert(key, candidate.start);
            return Ok(Ingested::Opened);
        };

        let Some(open) = self.open.remove(&key) else {
            debug!(
                subject = %candidate.subject,
                relation = %relation,
                end,
                "Ignoring close without a matching open episode"
            );
            return Ok(Ingested::Ignored);
        };
        self.last_committed.insert(key.clone(), end);
        let (subject, _) = key;

        Ok(Ingested::Closed(ClosedEpisode {
            subject,
            relation,
            start: open.start,
            end: end.max(open.start),
            flags: candidate.flags,
            confidence: candidate.confidence,
            detector: open.detector,
        }))
    }

    /// Closes every open episode at `last_observed`, flagged unterminated.
    pub fn finalize(&mut self, last_observed: f64) -> Vec<ClosedEpisode> {
        let open = std::mem::take(&mut self.open);
        open.into_iter()
            .map(|((subject, relation), episode)| {
                let end = last_observed.max(episode.start);
                self.last_committed.insert((subject.clone(), relation), end);
                ClosedEpisode {
                    subject,
                    relation,
                    start: episode.start,
                    end,
                    flags: EpisodeFlags::UNTERMINATED,
                    confidence: Confidence::MAX,
                    detector: episode.detector,
                }
            })
            .collect()
    }

    fn check_overlap(&self, candidate: &CandidateEvent, key: &SlotKey) -> Result<(), Anomaly> {
        let relation = key.1;
        let conflict = |subject: &Subject, entity: EntityId| {
            warn!(
                subject = %candidate.subject,
                relation = %relation,
                open = %subject,
                timestamp = candidate.start,
                "Dropping overlapping candidate"
            );
            Anomaly::OverlappingRelation {
                subject: candidate.subject.clone(),
                relation,
                entity,
                open_subject: subject.clone(),
                timestamp: candidate.start,
            }
        };

        if self.open.contains_key(key) {
            let entity = candidate.subject.entities()[0].clone();
            return Err(conflict(&candidate.subject, entity));
        }
        if self.concurrent.contains(&relation) {
            return Ok(());
        }
        for entity in candidate.subject.entities() {
            if let Some((subject, _)) = self
                .open
                .keys()
                .find(|(subject, r)| *r == relation && subject.involves(entity))
            {
                return Err(conflict(subject, entity.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::EventKind;
    use crate::types::EntityPair;

    fn pair(a: &str, b: &str) -> Subject {
        Subject::Pair(EntityPair::new(EntityId::new(a).unwrap(), EntityId::new(b).unwrap()).unwrap())
    }

    fn open(kind: EventKind, subject: &Subject, start: f64) -> CandidateEvent {
        CandidateEvent {
            kind,
            subject: subject.clone(),
            start,
            end: None,
            flags: EpisodeFlags::default(),
            confidence: Confidence::MAX,
            detector: DetectorId::for_slot(kind.relation(), subject),
        }
    }

    fn close(kind: EventKind, subject: &Subject, start: f64, end: f64) -> CandidateEvent {
        CandidateEvent {
            end: Some(end),
            ..open(kind, subject, start)
        }
    }

    fn aggregator() -> EpisodeAggregator {
        EpisodeAggregator::new([Relation::Contact, Relation::Motion].into_iter().collect())
    }

    #[test]
    fn pairs_open_and_close() {
        let mut agg = aggregator();
        let hand_cup = pair("hand", "cup");

        assert_eq!(
            agg.ingest(&open(EventKind::ContactStart, &hand_cup, 1.0)),
            Ok(Ingested::Opened)
        );
        assert!(agg.is_open(&hand_cup, Relation::Contact));

        let Ok(Ingested::Closed(closed)) =
            agg.ingest(&close(EventKind::ContactEnd, &hand_cup, 1.0, 2.0))
        else {
            panic!("expected a closed episode");
        };
        assert!((closed.start - 1.0).abs() < f64::EPSILON);
        assert!((closed.end - 2.0).abs() < f64::EPSILON);
        assert_eq!(agg.open_count(), 0);
    }

    #[test]
    fn close_without_open_is_ignored() {
        let mut agg = aggregator();
        let hand_cup = pair("hand", "cup");
        assert_eq!(
            agg.ingest(&close(EventKind::ContactEnd, &hand_cup, 1.0, 2.0)),
            Ok(Ingested::Ignored)
        );
    }

    #[test]
    fn rejects_reopening_an_open_slot() {
        let mut agg = aggregator();
        let hand_cup = pair("hand", "cup");
        agg.ingest(&open(EventKind::ContactStart, &hand_cup, 1.0)).unwrap();
        let err = agg
            .ingest(&open(EventKind::ContactStart, &hand_cup, 1.5))
            .unwrap_err();
        assert!(matches!(err, Anomaly::OverlappingRelation { .. }));
    }

    #[test]
    fn contact_shares_a_slot_across_pair_orders() {
        let mut agg = aggregator();
        agg.ingest(&open(EventKind::ContactStart, &pair("hand", "cup"), 1.0))
            .unwrap();
        assert!(agg.is_open(&pair("cup", "hand"), Relation::Contact));

        let err = agg
            .ingest(&open(EventKind::ContactStart, &pair("cup", "hand"), 1.2))
            .unwrap_err();
        assert!(matches!(err, Anomaly::OverlappingRelation { .. }));

        let Ok(Ingested::Closed(closed)) =
            agg.ingest(&close(EventKind::ContactEnd, &pair("cup", "hand"), 1.0, 2.0))
        else {
            panic!("expected a closed episode");
        };
        assert_eq!(closed.subject.to_string(), "cup~hand");
        assert_eq!(agg.open_count(), 0);
    }

    #[test]
    fn exclusive_relation_blocks_second_partner() {
        let mut agg = aggregator();
        let on_table = pair("cup", "table");
        let on_shelf = pair("cup", "shelf");

        agg.ingest(&open(EventKind::SupportStart, &on_table, 1.0)).unwrap();
        let err = agg
            .ingest(&open(EventKind::SupportStart, &on_shelf, 1.2))
            .unwrap_err();
        let Anomaly::OverlappingRelation {
            entity,
            open_subject,
            ..
        } = err
        else {
            panic!("expected an overlap");
        };
        assert_eq!(entity.as_str(), "cup");
        assert_eq!(open_subject, on_table);
    }

    #[test]
    fn concurrent_relation_allows_several_partners() {
        let mut agg = aggregator();
        agg.ingest(&open(EventKind::ContactStart, &pair("cup", "table"), 1.0))
            .unwrap();
        assert_eq!(
            agg.ingest(&open(EventKind::ContactStart, &pair("hand", "cup"), 1.2)),
            Ok(Ingested::Opened)
        );
    }

    #[test]
    fn drops_candidates_older_than_last_commit() {
        let mut agg = aggregator();
        let hand_cup = pair("hand", "cup");
        agg.ingest(&open(EventKind::ContactStart, &hand_cup, 1.0)).unwrap();
        agg.ingest(&close(EventKind::ContactEnd, &hand_cup, 1.0, 2.0))
            .unwrap();

        let err = agg
            .ingest(&open(EventKind::ContactStart, &hand_cup, 1.5))
            .unwrap_err();
        assert!(matches!(err, Anomaly::OutOfOrderInput { .. }));
        assert!(!agg.is_open(&hand_cup, Relation::Contact));
    }

    #[test]
    fn finalize_closes_everything_unterminated() {
        let mut agg = aggregator();
        agg.ingest(&open(EventKind::ContactStart, &pair("hand", "cup"), 1.0))
            .unwrap();
        agg.ingest(&open(EventKind::SupportStart, &pair("cup", "table"), 0.5))
            .unwrap();
        assert_eq!(agg.earliest_open_start(), Some(0.5));

        let closed = agg.finalize(3.0);
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.flags.unterminated));
        assert!(closed.iter().all(|c| (c.end - 3.0).abs() < f64::EPSILON));
        assert_eq!(agg.open_count(), 0);
    }
}
