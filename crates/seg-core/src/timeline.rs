//! Append-only store of finalized episodes and activities.
//!
//! A [`TimelineStore`] is a cheap handle; clones share one log behind a
//! read-write lock. The engine is the single writer. Readers take queries
//! that capture the committed length when they are created and never see
//! later appends.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::episode::{Activity, ActivityId, ActivityMatch, ClosedEpisode, Episode, EpisodeId};
use crate::error::AnomalyCounts;
use crate::relation::Relation;
use crate::types::{Entity, EntityId, EntityKind, Subject};

/// Records the store refuses to append.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimelineError {
    #[error("episode for {subject} ends before it starts ({start} > {end})")]
    InvertedInterval { subject: String, start: f64, end: f64 },

    #[error("{relation} episode for {subject} starting at {start} overlaps one ending at {previous_end}")]
    Overlap {
        subject: String,
        relation: Relation,
        start: f64,
        previous_end: f64,
    },

    #[error("unknown episode: {0}")]
    UnknownEpisode(EpisodeId),

    #[error("episode {0} is already superseded")]
    AlreadySuperseded(EpisodeId),

    #[error("correction for {old} must keep {expected}, got {found}")]
    SlotMismatch {
        old: EpisodeId,
        expected: String,
        found: String,
    },
}

/// An entity with the time it first appeared in the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub first_seen: f64,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub entities: Vec<EntityRecord>,
    /// Every episode ever appended, superseded ones included, in id order.
    pub episodes: Vec<Episode>,
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub anomalies: AnomalyCounts,
}

impl TimelineSnapshot {
    /// Episodes no correction has replaced.
    pub fn effective_episodes(&self) -> impl Iterator<Item = &Episode> {
        let superseded: Vec<EpisodeId> = self.episodes.iter().filter_map(|e| e.supersedes).collect();
        self.episodes
            .iter()
            .filter(move |e| !superseded.contains(&e.id))
    }
}

#[derive(Debug, Default)]
struct Records {
    entities: BTreeMap<EntityId, EntityRecord>,
    episodes: Vec<Episode>,
    activities: Vec<Activity>,
    /// Episode positions per involved entity, in append order.
    by_entity: HashMap<EntityId, Vec<usize>>,
    /// Old episode to the position of the record replacing it.
    superseded_by: HashMap<EpisodeId, usize>,
    last_end: HashMap<SlotKey, f64>,
}

type SlotKey = (Subject, Relation);

fn slot_key(subject: &Subject, relation: Relation) -> SlotKey {
    (subject.slot_for(relation), relation)
}

impl Records {
    /// Effective episodes sharing `key`'s slot that overlap `[start, end]`,
    /// other than `except`. Touching endpoints do not count.
    fn overlapping(&self, key: &SlotKey, start: f64, end: f64, except: EpisodeId) -> Option<&Episode> {
        let committed = self.episodes.len();
        self.episodes.iter().enumerate().find_map(|(i, e)| {
            let hit = e.id != except
                && e.relation == key.1
                && e.subject.slot_for(key.1) == key.0
                && e.start < end
                && start < e.end
                && self.is_effective(i, committed);
            hit.then_some(e)
        })
    }

    fn is_effective(&self, position: usize, committed: usize) -> bool {
        self.episodes.get(position).is_some_and(|e| {
            self.superseded_by
                .get(&e.id)
                .is_none_or(|&replacement| replacement >= committed)
        })
    }

    fn push_episode(&mut self, closed: ClosedEpisode, supersedes: Option<EpisodeId>) -> EpisodeId {
        let position = self.episodes.len();
        let id = EpisodeId::new(position as u64);
        let episode = Episode::from_closed(id, closed, supersedes);
        for entity in episode.subject.entities() {
            self.by_entity.entry(entity.clone()).or_default().push(position);
        }
        let key = slot_key(&episode.subject, episode.relation);
        let end = self.last_end.get(&key).map_or(episode.end, |e| e.max(episode.end));
        self.last_end.insert(key, end);
        if let Some(old) = supersedes {
            self.superseded_by.insert(old, position);
        }
        self.episodes.push(episode);
        id
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelineStore {
    inner: Arc<RwLock<Records>>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an entity the first time it is seen. Later calls keep the
    /// original record.
    pub fn register_entity(&self, entity: &Entity, first_seen: f64) {
        self.write()
            .entities
            .entry(entity.id.clone())
            .or_insert_with(|| EntityRecord {
                id: entity.id.clone(),
                kind: entity.kind,
                first_seen,
            });
    }

    pub fn entities(&self) -> Vec<EntityRecord> {
        self.read().entities.values().cloned().collect()
    }

    /// Appends a finalized episode.
    ///
    /// Rejects intervals that end before they start, or that start before the
    /// previous episode of the same subject and relation ended. Both orders of
    /// a symmetric pair count as the same subject.
    pub fn append_episode(&self, closed: ClosedEpisode) -> Result<EpisodeId, TimelineError> {
        let mut records = self.write();
        if closed.end < closed.start {
            return Err(TimelineError::InvertedInterval {
                subject: closed.subject.to_string(),
                start: closed.start,
                end: closed.end,
            });
        }
        if let Some(&previous_end) = records.last_end.get(&slot_key(&closed.subject, closed.relation)) {
            if closed.start < previous_end {
                return Err(TimelineError::Overlap {
                    subject: closed.subject.to_string(),
                    relation: closed.relation,
                    start: closed.start,
                    previous_end,
                });
            }
        }
        let id = records.push_episode(closed, None);
        debug!(episode = %id, "Appended episode");
        Ok(id)
    }

    /// Appends a correction for `old`. The old record stays readable through
    /// [`Self::history`] but drops out of queries.
    ///
    /// The replacement must keep the subject and relation of `old` and must
    /// not overlap any other effective episode of that slot.
    pub fn supersede(&self, old: EpisodeId, replacement: ClosedEpisode) -> Result<EpisodeId, TimelineError> {
        let mut records = self.write();
        let Some(previous) = records.episodes.get(position_of(old)) else {
            return Err(TimelineError::UnknownEpisode(old));
        };
        let key = slot_key(&previous.subject, previous.relation);
        if slot_key(&replacement.subject, replacement.relation) != key {
            return Err(TimelineError::SlotMismatch {
                old,
                expected: format!("{}:{}", previous.relation, previous.subject),
                found: format!("{}:{}", replacement.relation, replacement.subject),
            });
        }
        if records.superseded_by.contains_key(&old) {
            return Err(TimelineError::AlreadySuperseded(old));
        }
        if replacement.end < replacement.start {
            return Err(TimelineError::InvertedInterval {
                subject: replacement.subject.to_string(),
                start: replacement.start,
                end: replacement.end,
            });
        }
        if let Some(neighbour) = records.overlapping(&key, replacement.start, replacement.end, old) {
            return Err(TimelineError::Overlap {
                subject: replacement.subject.to_string(),
                relation: replacement.relation,
                start: replacement.start,
                previous_end: neighbour.end,
            });
        }
        let id = records.push_episode(replacement, Some(old));
        debug!(episode = %id, supersedes = %old, "Appended correction");
        Ok(id)
    }

    /// Appends an activity. Every episode it references must exist.
    pub fn append_activity(&self, found: ActivityMatch) -> Result<ActivityId, TimelineError> {
        let mut records = self.write();
        if let Some(missing) = found
            .episodes
            .iter()
            .find(|id| records.episodes.get(position_of(**id)).is_none())
        {
            return Err(TimelineError::UnknownEpisode(*missing));
        }
        let id = ActivityId::new(records.activities.len() as u64);
        records.activities.push(Activity::from_match(id, found));
        Ok(id)
    }

    pub fn episode(&self, id: EpisodeId) -> Option<Episode> {
        self.read().episodes.get(position_of(id)).cloned()
    }

    pub fn episode_count(&self) -> usize {
        self.read().episodes.len()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.read().activities.clone()
    }

    /// Effective episodes involving `entity` that overlap `[from, to]`.
    pub fn query(&self, entity: &EntityId, from: f64, to: f64) -> EpisodeQuery {
        let records = self.read();
        let committed = records.episodes.len();
        let mut positions: Vec<usize> = records
            .by_entity
            .get(entity)
            .map(|p| {
                p.iter()
                    .copied()
                    .filter(|&i| records.episodes[i].overlaps_range(from, to))
                    .collect()
            })
            .unwrap_or_default();
        positions.sort_by(|&a, &b| {
            records.episodes[a]
                .start
                .total_cmp(&records.episodes[b].start)
                .then(a.cmp(&b))
        });
        EpisodeQuery {
            store: self.clone(),
            positions,
            committed,
        }
    }

    /// The most recent effective episode of `relation` for `subject`.
    pub fn latest(&self, subject: &Subject, relation: Relation) -> Option<Episode> {
        let records = self.read();
        let committed = records.episodes.len();
        let key = slot_key(subject, relation);
        records
            .episodes
            .iter()
            .enumerate()
            .rev()
            .find(|(i, e)| {
                e.relation == relation
                    && slot_key(&e.subject, e.relation) == key
                    && records.is_effective(*i, committed)
            })
            .map(|(_, e)| e.clone())
    }

    /// The effective episode of `relation` involving `entity` closest in time
    /// to `t`. Ties go to the earlier record.
    pub fn nearest(&self, entity: &EntityId, relation: Relation, t: f64) -> Option<Episode> {
        let records = self.read();
        let committed = records.episodes.len();
        let distance = |e: &Episode| {
            if t < e.start {
                e.start - t
            } else if t > e.end {
                t - e.end
            } else {
                0.0
            }
        };
        records
            .by_entity
            .get(entity)?
            .iter()
            .copied()
            .filter(|&i| records.episodes[i].relation == relation && records.is_effective(i, committed))
            .map(|i| &records.episodes[i])
            .min_by(|a, b| distance(*a).total_cmp(&distance(*b)).then(a.id.cmp(&b.id)))
            .cloned()
    }

    /// The correction chain ending at `id`, oldest record first.
    pub fn history(&self, id: EpisodeId) -> Vec<Episode> {
        let records = self.read();
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(current) = next {
            let Some(episode) = records.episodes.get(position_of(current)) else {
                break;
            };
            chain.push(episode.clone());
            next = episode.supersedes;
        }
        chain.reverse();
        chain
    }

    /// Full snapshot of everything appended so far.
    pub fn finalize(&self) -> TimelineSnapshot {
        let records = self.read();
        TimelineSnapshot {
            entities: records.entities.values().cloned().collect(),
            episodes: records.episodes.clone(),
            activities: records.activities.clone(),
            anomalies: AnomalyCounts::default(),
        }
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "ids are issued from in-memory positions"
)]
const fn position_of(id: EpisodeId) -> usize {
    id.value() as usize
}

/// A finite, restartable view of query results.
///
/// Iterating clones records out of the store one at a time. Records appended
/// after the query was created are never visible, and neither are
/// corrections appended afterwards.
#[derive(Debug, Clone)]
pub struct EpisodeQuery {
    store: TimelineStore,
    positions: Vec<usize>,
    committed: usize,
}

impl EpisodeQuery {
    pub fn iter(&self) -> EpisodeIter<'_> {
        EpisodeIter {
            query: self,
            cursor: 0,
        }
    }

    /// Upper bound on the number of results.
    pub fn len_hint(&self) -> usize {
        self.positions.len()
    }
}

impl<'q> IntoIterator for &'q EpisodeQuery {
    type Item = Episode;
    type IntoIter = EpisodeIter<'q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug)]
pub struct EpisodeIter<'q> {
    query: &'q EpisodeQuery,
    cursor: usize,
}

impl Iterator for EpisodeIter<'_> {
    type Item = Episode;

    fn next(&mut self) -> Option<Episode> {
        let records = self.query.store.read();
        while let Some(&position) = self.query.positions.get(self.cursor) {
            self.cursor += 1;
            if records.is_effective(position, self.query.committed) {
                return records.episodes.get(position).cloned();
            }
        }
        None
    }
}
