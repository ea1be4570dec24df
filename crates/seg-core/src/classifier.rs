//! Activity recognition over finalized episodes.
//!
//! The classifier keeps a sliding window of recent episodes and, each time an
//! episode is finalized, searches every rule for matches that include it.
//! Competing matches are ranked and accepted greedily so each episode boundary
//! belongs to at most one activity.
//!
//! The window is pruned against a watermark: the earliest time any episode
//! finalized later can start. Anything ending more than the look-back window
//! before it can no longer take part in a match, so online classification and
//! an offline [`ActivityClassifier::replay`] of the same episodes agree.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::config::SegmenterConfig;
use crate::episode::{ActivityMatch, Episode, EpisodeId};
use crate::error::Anomaly;
use crate::relation::Anchor;
use crate::rules::{ActivityRule, RuleStep};
use crate::types::{Entity, EntityId, EntityKind, Subject};

/// Slack for comparing timestamps that went through arithmetic.
const TIME_EPSILON: f64 = 1e-9;

/// Activities accepted and anomalies raised by one classification pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub activities: Vec<ActivityMatch>,
    pub anomalies: Vec<Anomaly>,
}

impl Classification {
    fn extend(&mut self, other: Self) {
        self.activities.extend(other.activities);
        self.anomalies.extend(other.anomalies);
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    found: ActivityMatch,
    anchors: Vec<(EpisodeId, Anchor)>,
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.found
        .priority
        .cmp(&a.found.priority)
        .then_with(|| a.found.start.total_cmp(&b.found.start))
        .then_with(|| a.found.rule_index.cmp(&b.found.rule_index))
        .then_with(|| a.found.episodes.cmp(&b.found.episodes))
}

#[derive(Debug, Clone)]
pub struct ActivityClassifier {
    rules: Vec<ActivityRule>,
    kinds: HashMap<EntityId, EntityKind>,
    lookback: f64,
    max_window: usize,
    window: VecDeque<Episode>,
    /// Boundaries already used by an accepted activity, with its name.
    claimed: HashMap<(EpisodeId, Anchor), String>,
}

impl ActivityClassifier {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            rules: config.activity_rules.clone(),
            kinds: HashMap::new(),
            lookback: config.lookback_window(),
            max_window: config.max_window_episodes.max(1),
            window: VecDeque::new(),
            claimed: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &[ActivityRule] {
        &self.rules
    }

    /// Records an entity's kind for `role_kinds` checks. Unknown entities
    /// count as objects.
    pub fn register_entity(&mut self, entity: &Entity) {
        self.kinds.insert(entity.id.clone(), entity.kind);
    }

    /// Episodes currently retained.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Classifies a newly finalized episode.
    ///
    /// `watermark` is the earliest start any episode finalized after this one
    /// can have.
    pub fn observe(&mut self, episode: &Episode, watermark: f64) -> Classification {
        self.window.push_back(episode.clone());

        let mut candidates = Vec::new();
        for (rule_index, rule) in self.rules.iter().enumerate() {
            let search = Search {
                rule_index,
                rule,
                window: &self.window,
                kinds: &self.kinds,
                trigger: episode,
                earliest: episode.start - rule.span() - TIME_EPSILON,
            };
            search.run(&mut candidates);
        }
        candidates.sort_by(rank);
        candidates.dedup_by(|b, a| a.found.rule_index == b.found.rule_index && a.anchors == b.anchors);

        let mut result = Classification::default();
        for candidate in candidates {
            if let Some(kept) = candidate
                .anchors
                .iter()
                .find_map(|anchor| self.claimed.get(anchor))
            {
                debug!(
                    kept = %kept,
                    discarded = %candidate.found.name,
                    episodes = ?candidate.found.episodes,
                    "Discarding ambiguous activity match"
                );
                result.anomalies.push(Anomaly::AmbiguousActivityMatch {
                    kept: kept.clone(),
                    discarded: candidate.found.name.clone(),
                    episodes: candidate.found.episodes.clone(),
                });
                continue;
            }
            for anchor in &candidate.anchors {
                self.claimed.insert(*anchor, candidate.found.name.clone());
            }
            result.activities.push(candidate.found);
        }

        self.prune(watermark);
        result
    }

    /// Classifies a finished list of episodes in finalization order.
    ///
    /// Gives the same activities as observing them one by one during a run.
    pub fn replay(&mut self, episodes: &[Episode]) -> Classification {
        let mut ordered: Vec<&Episode> = episodes.iter().collect();
        ordered.sort_by_key(|e| e.id);

        // earliest start among the episodes after each position
        let mut floors = vec![f64::INFINITY; ordered.len() + 1];
        for (i, episode) in ordered.iter().enumerate().rev() {
            floors[i] = floors[i + 1].min(episode.start);
        }

        let mut result = Classification::default();
        for (i, episode) in ordered.iter().enumerate() {
            result.extend(self.observe(episode, floors[i + 1]));
        }
        result
    }

    fn prune(&mut self, watermark: f64) {
        let horizon = watermark - self.lookback - TIME_EPSILON;
        let before = self.window.len();
        self.window.retain(|e| e.end >= horizon);

        while self.window.len() > self.max_window {
            if let Some(evicted) = self.window.pop_front() {
                warn!(
                    episode = %evicted.id,
                    cap = self.max_window,
                    "Classifier window full, evicting oldest episode"
                );
            }
        }

        if self.window.len() != before {
            let live: HashSet<EpisodeId> = self.window.iter().map(|e| e.id).collect();
            self.claimed.retain(|(id, _), _| live.contains(id));
        }
    }
}

/// Backtracking search for the matches of one rule that include `trigger`.
struct Search<'a> {
    rule_index: usize,
    rule: &'a ActivityRule,
    window: &'a VecDeque<Episode>,
    kinds: &'a HashMap<EntityId, EntityKind>,
    trigger: &'a Episode,
    /// Lower bound on the first boundary of any match containing `trigger`.
    earliest: f64,
}

type Binding<'e> = Vec<(&'e str, &'e EntityId)>;

impl<'a> Search<'a> {
    fn run(&self, out: &mut Vec<Candidate>) {
        let mut roles = BTreeMap::new();
        let mut chosen = Vec::with_capacity(self.rule.steps.len());
        self.extend(0, None, &mut roles, &mut chosen, out);
    }

    fn extend(
        &self,
        step: usize,
        previous: Option<f64>,
        roles: &mut BTreeMap<String, EntityId>,
        chosen: &mut Vec<(&'a Episode, Anchor)>,
        out: &mut Vec<Candidate>,
    ) {
        let Some(wanted) = self.rule.steps.get(step) else {
            if chosen.iter().any(|(e, _)| e.id == self.trigger.id) {
                out.push(self.build(roles, chosen));
            }
            return;
        };
        let relation = wanted.event.relation();
        let anchor = wanted.event.anchor();

        for episode in self.window.iter().filter(|e| e.relation == relation) {
            let Some(at) = episode.anchor_time(anchor) else {
                continue;
            };
            let in_range = match previous {
                None => at >= self.earliest && at <= self.trigger.end + TIME_EPSILON,
                Some(prev) => {
                    let within = wanted.within.unwrap_or(0.0);
                    at >= prev - TIME_EPSILON && at - prev <= within + TIME_EPSILON
                }
            };
            if !in_range
                || chosen
                    .iter()
                    .any(|(e, a)| e.id == episode.id && *a == anchor)
            {
                continue;
            }

            for binding in bindings(wanted, &episode.subject) {
                let Some(added) = self.bind(roles, &binding) else {
                    continue;
                };
                chosen.push((episode, anchor));
                self.extend(step + 1, Some(at), roles, chosen, out);
                chosen.pop();
                for role in added {
                    roles.remove(&role);
                }
            }
        }
    }

    /// Binds roles to entities, returning the roles newly bound, or `None`
    /// (with `roles` unchanged) when the binding conflicts.
    fn bind(&self, roles: &mut BTreeMap<String, EntityId>, binding: &Binding<'_>) -> Option<Vec<String>> {
        let mut added = Vec::new();
        for (role, entity) in binding {
            let ok = match roles.get(*role) {
                Some(bound) => bound == *entity,
                None => {
                    let taken = roles.values().any(|bound| bound == *entity);
                    let kind = self.kinds.get(*entity).copied().unwrap_or_default();
                    let kind_ok = self.rule.role_kinds.get(*role).is_none_or(|k| *k == kind);
                    !taken && kind_ok
                }
            };
            if !ok {
                for role in added {
                    roles.remove(&role);
                }
                return None;
            }
            if !roles.contains_key(*role) {
                roles.insert((*role).to_string(), (*entity).clone());
                added.push((*role).to_string());
            }
        }
        Some(added)
    }

    fn build(&self, roles: &BTreeMap<String, EntityId>, chosen: &[(&Episode, Anchor)]) -> Candidate {
        let start = chosen.iter().map(|(e, _)| e.start).fold(f64::INFINITY, f64::min);
        let end = chosen
            .iter()
            .map(|(e, _)| e.end)
            .fold(f64::NEG_INFINITY, f64::max);
        Candidate {
            found: ActivityMatch {
                name: self.rule.name.clone(),
                rule_index: self.rule_index,
                priority: self.rule.priority,
                roles: roles.clone(),
                episodes: chosen.iter().map(|(e, _)| e.id).collect(),
                start,
                end,
            },
            anchors: chosen.iter().map(|(e, a)| (e.id, *a)).collect(),
        }
    }
}

/// Ways a step's roles can bind to an episode subject. Symmetric relations
/// match the pair in either order.
fn bindings<'e>(step: &'e RuleStep, subject: &'e Subject) -> Vec<Binding<'e>> {
    match subject {
        Subject::Entity(id) => step
            .roles
            .first()
            .map(|role| vec![vec![(role.as_str(), id)]])
            .unwrap_or_default(),
        Subject::Pair(pair) => {
            let [r0, r1] = step.roles.as_slice() else {
                return Vec::new();
            };
            let mut out = vec![vec![(r0.as_str(), pair.first()), (r1.as_str(), pair.second())]];
            if step.event.relation().is_symmetric() {
                out.push(vec![(r0.as_str(), pair.second()), (r1.as_str(), pair.first())]);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeFlags;
    use crate::relation::{EventKind, Relation};
    use crate::types::{Confidence, DetectorId, EntityPair};

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn pair(a: &str, b: &str) -> Subject {
        Subject::Pair(EntityPair::new(id(a), id(b)).unwrap())
    }

    fn single(a: &str) -> Subject {
        Subject::Entity(id(a))
    }

    fn episode(n: u64, subject: Subject, relation: Relation, start: f64, end: f64) -> Episode {
        Episode {
            id: EpisodeId::new(n),
            detector: DetectorId::for_slot(relation, &subject),
            subject,
            relation,
            start,
            end,
            flags: EpisodeFlags::default(),
            confidence: Confidence::MAX,
            supersedes: None,
        }
    }

    /// Hand grabs the cup at 1.0, it lifts at 1.3, and leaves the table at 1.4.
    fn pick_episodes() -> Vec<Episode> {
        vec![
            episode(0, pair("hand", "cup"), Relation::Contact, 1.0, 1.2),
            episode(1, pair("cup", "table"), Relation::Contact, 0.0, 1.4),
            episode(2, single("cup"), Relation::Motion, 1.3, 4.0),
        ]
    }

    fn classifier() -> ActivityClassifier {
        ActivityClassifier::new(&SegmenterConfig::default())
    }

    #[test]
    fn recognizes_pick() {
        let result = classifier().replay(&pick_episodes());

        assert_eq!(result.activities.len(), 1);
        let pick = &result.activities[0];
        assert_eq!(pick.name, "pick");
        assert_eq!(pick.roles["actor"].as_str(), "hand");
        assert_eq!(pick.roles["object"].as_str(), "cup");
        assert_eq!(pick.roles["surface"].as_str(), "table");
        assert_eq!(
            pick.episodes,
            vec![EpisodeId::new(0), EpisodeId::new(2), EpisodeId::new(1)]
        );
        assert!((pick.start - 0.0).abs() < f64::EPSILON);
        assert!((pick.end - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn online_observation_matches_replay() {
        let episodes = pick_episodes();
        let mut online = classifier();
        let mut found = Vec::new();
        for e in &episodes {
            found.extend(online.observe(e, e.start).activities);
        }
        assert_eq!(found, classifier().replay(&episodes).activities);
    }

    #[test]
    fn unterminated_end_does_not_anchor() {
        let mut episodes = pick_episodes();
        episodes[1].flags = EpisodeFlags::UNTERMINATED;
        let result = classifier().replay(&episodes);
        assert!(result.activities.is_empty());
    }

    #[test]
    fn within_bound_is_enforced() {
        let mut episodes = pick_episodes();
        // object starts moving 1.5s after the grasp
        episodes[2].start = 2.5;
        episodes[1].end = 2.6;
        let result = classifier().replay(&episodes);
        assert!(result.activities.is_empty());
    }

    #[test]
    fn roles_bind_distinct_entities() {
        let rule = ActivityRule {
            name: "two_movers".to_string(),
            priority: 0,
            role_kinds: BTreeMap::new(),
            steps: vec![
                RuleStep::new(EventKind::MotionStart, &["a"], None),
                RuleStep::new(EventKind::MotionStart, &["b"], Some(1.0)),
            ],
        };
        let config = SegmenterConfig {
            activity_rules: vec![rule],
            ..SegmenterConfig::default()
        };
        let mut classifier = ActivityClassifier::new(&config);
        let episodes = vec![
            episode(0, single("cup"), Relation::Motion, 1.0, 2.0),
            episode(1, single("cup"), Relation::Motion, 1.5, 3.0),
        ];
        assert!(classifier.replay(&episodes).activities.is_empty());
    }

    #[test]
    fn role_kinds_filter_matches() {
        let mut config = SegmenterConfig::default();
        config.activity_rules[0]
            .role_kinds
            .insert("actor".to_string(), EntityKind::RobotLink);
        let episodes = pick_episodes();

        let mut untyped = ActivityClassifier::new(&config);
        assert!(untyped.replay(&episodes).activities.is_empty());

        let mut typed = ActivityClassifier::new(&config);
        typed.register_entity(&Entity::new(id("hand"), EntityKind::RobotLink));
        assert_eq!(typed.replay(&episodes).activities.len(), 1);
    }

    #[test]
    fn competing_matches_keep_higher_priority() {
        let mut config = SegmenterConfig::default();
        let mut grab = config.activity_rules[0].clone();
        grab.name = "grab".to_string();
        grab.priority = 20;
        config.activity_rules.push(grab);

        let result = ActivityClassifier::new(&config).replay(&pick_episodes());

        assert_eq!(result.activities.len(), 1);
        assert_eq!(result.activities[0].name, "grab");
        assert_eq!(
            result.anomalies,
            vec![Anomaly::AmbiguousActivityMatch {
                kept: "grab".to_string(),
                discarded: "pick".to_string(),
                episodes: vec![EpisodeId::new(0), EpisodeId::new(2), EpisodeId::new(1)],
            }]
        );
    }

    #[test]
    fn equal_priority_goes_to_first_declared_rule() {
        let mut config = SegmenterConfig::default();
        let mut lift = config.activity_rules[0].clone();
        lift.name = "lift".to_string();
        config.activity_rules.insert(0, lift);

        let result = ActivityClassifier::new(&config).replay(&pick_episodes());
        assert_eq!(result.activities.len(), 1);
        assert_eq!(result.activities[0].name, "lift");
        assert_eq!(result.activities[0].rule_index, 0);

        config.activity_rules.swap(0, 1);
        let result = ActivityClassifier::new(&config).replay(&pick_episodes());
        assert_eq!(result.activities.len(), 1);
        assert_eq!(result.activities[0].name, "pick");
        assert!(matches!(
            result.anomalies.as_slice(),
            [Anomaly::AmbiguousActivityMatch { kept, discarded, .. }] if kept == "pick" && discarded == "lift"
        ));
    }

    #[test]
    fn equal_priority_goes_to_earlier_start() {
        let rule = ActivityRule {
            name: "push".to_string(),
            priority: 0,
            role_kinds: BTreeMap::new(),
            steps: vec![
                RuleStep::new(EventKind::ContactStart, &["actor", "object"], None),
                RuleStep::new(EventKind::MotionStart, &["object"], Some(1.0)),
            ],
        };
        let config = SegmenterConfig {
            activity_rules: vec![rule],
            ..SegmenterConfig::default()
        };
        // both contacts can explain the same motion start
        let episodes = vec![
            episode(0, pair("hand", "cup"), Relation::Contact, 1.0, 1.2),
            episode(1, pair("arm", "cup"), Relation::Contact, 0.8, 1.1),
            episode(2, single("cup"), Relation::Motion, 1.3, 4.0),
        ];

        let result = ActivityClassifier::new(&config).replay(&episodes);

        assert_eq!(result.activities.len(), 1);
        let push = &result.activities[0];
        assert_eq!(push.roles["actor"].as_str(), "arm");
        assert_eq!(push.episodes, vec![EpisodeId::new(1), EpisodeId::new(2)]);
        assert!((push.start - 0.8).abs() < f64::EPSILON);
        assert_eq!(result.anomalies.len(), 1);
    }

    #[test]
    fn window_is_pruned_behind_watermark() {
        let mut classifier = classifier();
        let old = episode(0, single("cup"), Relation::Motion, 0.0, 1.0);
        classifier.observe(&old, 1.0);
        assert_eq!(classifier.window_len(), 1);

        let later = episode(1, single("cup"), Relation::Motion, 10.0, 11.0);
        classifier.observe(&later, 11.0);
        assert_eq!(classifier.window_len(), 1);
    }

    #[test]
    fn window_cap_evicts_oldest() {
        let config = SegmenterConfig {
            max_window_episodes: 2,
            ..SegmenterConfig::default()
        };
        let mut classifier = ActivityClassifier::new(&config);
        for n in 0..4 {
            let t = f64::from(u32::try_from(n).unwrap());
            classifier.observe(&episode(n, single("cup"), Relation::Motion, t, t), 0.0);
        }
        assert_eq!(classifier.window_len(), 2);
    }
}
