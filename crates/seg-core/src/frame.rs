//! Per-tick input samples.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::geometry::{BodyState, PairPredicates, PredicateProvider};
use crate::types::{EntityId, EntityPair};

/// One timestep of kinematic state and pair predicates.
///
/// Frames are owned by the caller and consumed by [`Segmenter::push_frame`]
/// without being retained.
///
/// [`Segmenter::push_frame`]: crate::Segmenter::push_frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Seconds since the start of the recording. Must increase frame to frame.
    pub timestamp: f64,

    /// Body state per tracked entity.
    #[serde(default)]
    pub bodies: BTreeMap<EntityId, BodyState>,

    /// Predicates per entity pair.
    #[serde(default, with = "pair_samples")]
    pub pairs: BTreeMap<EntityPair, PairPredicates>,
}

impl Frame {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, id: EntityId, state: BodyState) -> Self {
        self.bodies.insert(id, state);
        self
    }

    #[must_use]
    pub fn with_pair(mut self, pair: EntityPair, predicates: PairPredicates) -> Self {
        self.pairs.insert(pair, predicates);
        self
    }

    pub fn body(&self, id: &EntityId) -> Option<&BodyState> {
        self.bodies.get(id)
    }

    pub fn pair(&self, pair: &EntityPair) -> Option<&PairPredicates> {
        self.pairs.get(pair)
    }

    /// Contact between the two entities of `pair`, sampled in either order.
    ///
    /// `None` when neither order carries predicates. Either record touching
    /// counts as contact.
    pub fn contact(&self, pair: &EntityPair) -> Option<bool> {
        let forward = self.pairs.get(pair).map(|p| p.contact);
        let backward = self.pairs.get(&pair.reversed()).map(|p| p.contact);
        forward.into_iter().chain(backward).reduce(|a, b| a || b)
    }

    /// Entities mentioned anywhere in the frame, bodies first.
    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.bodies
            .keys()
            .chain(self.pairs.keys().flat_map(|p| [p.first(), p.second()]))
    }

    /// Checks the fields the whole pipeline depends on.
    pub fn validate(&self) -> Result<(), FrameError> {
        if !self.timestamp.is_finite() {
            return Err(FrameError::NonFiniteTimestamp {
                timestamp: self.timestamp,
            });
        }
        for (id, state) in &self.bodies {
            if !state.pose.is_finite() || state.twist.is_some_and(|t| !t.is_finite()) {
                return Err(FrameError::NonFiniteBody {
                    timestamp: self.timestamp,
                    entity: id.to_string(),
                });
            }
        }
        for (pair, predicates) in &self.pairs {
            if !predicates.is_finite() {
                return Err(FrameError::NonFinitePredicate {
                    timestamp: self.timestamp,
                    pair: pair.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fills predicates for `pairs` from body states through `provider`.
    ///
    /// Pairs that already carry predicates in either order, or whose bodies
    /// are not both present, are left untouched.
    pub fn apply_provider<P: PredicateProvider + ?Sized>(
        &mut self,
        provider: &P,
        pairs: &[EntityPair],
    ) {
        for pair in pairs {
            if self.pairs.contains_key(pair) || self.pairs.contains_key(&pair.reversed()) {
                continue;
            }
            let (Some(a), Some(b)) = (self.bodies.get(pair.first()), self.bodies.get(pair.second()))
            else {
                continue;
            };
            let predicates = provider.evaluate(a, b);
            self.pairs.insert(pair.clone(), predicates);
        }
    }
}

/// A lazy sequence of frames: finite for recordings, unbounded for live input.
pub trait FrameSource: Iterator<Item = Result<Frame, FrameError>> {}

impl<T> FrameSource for T where T: Iterator<Item = Result<Frame, FrameError>> {}

/// Pairs serialize as a list of `{ "pair": [a, b], ...predicates }` objects,
/// since JSON maps only take string keys.
mod pair_samples {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::geometry::PairPredicates;
    use crate::types::EntityPair;

    #[derive(Serialize, Deserialize)]
    struct PairSample {
        pair: EntityPair,
        #[serde(flatten)]
        predicates: PairPredicates,
    }

    pub fn serialize<S>(
        pairs: &BTreeMap<EntityPair, PairPredicates>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let samples: Vec<PairSample> = pairs
            .iter()
            .map(|(pair, predicates)| PairSample {
                pair: pair.clone(),
                predicates: *predicates,
            })
            .collect();
        samples.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<EntityPair, PairPredicates>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let samples = Vec::<PairSample>::deserialize(deserializer)?;
        let mut pairs = BTreeMap::new();
        for sample in samples {
            let key = sample.pair.to_string();
            if pairs.insert(sample.pair, sample.predicates).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate predicates for pair {key}"
                )));
            }
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Pose, ProximityProvider};

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn pair(a: &str, b: &str) -> EntityPair {
        EntityPair::new(id(a), id(b)).unwrap()
    }

    #[test]
    fn frame_parses_from_json() {
        let json = r#"{
            "timestamp": 1.5,
            "bodies": {
                "cup": {"pose": {"position": {"x": 0.0, "y": 0.0, "z": 0.8}}}
            },
            "pairs": [
                {"pair": ["hand", "cup"], "contact": true, "distance": 0.0}
            ]
        }"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert!((frame.timestamp - 1.5).abs() < f64::EPSILON);
        assert!(frame.body(&id("cup")).unwrap().twist.is_none());
        assert!(frame.pair(&pair("hand", "cup")).unwrap().contact);
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn frame_rejects_duplicate_pairs() {
        let json = r#"{
            "timestamp": 0.0,
            "pairs": [
                {"pair": ["hand", "cup"], "contact": true},
                {"pair": ["hand", "cup"], "contact": false}
            ]
        }"#;
        let result: Result<Frame, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let frame = Frame::new(f64::NAN);
        assert!(matches!(
            frame.validate(),
            Err(FrameError::NonFiniteTimestamp { .. })
        ));

        let frame = Frame::new(0.0).with_body(
            id("cup"),
            BodyState::at_rest(Pose::at(f64::INFINITY, 0.0, 0.0)),
        );
        assert!(matches!(
            frame.validate(),
            Err(FrameError::NonFiniteBody { .. })
        ));

        let frame = Frame::new(0.0).with_pair(pair("a", "b"), PairPredicates::apart(f64::NAN));
        assert!(matches!(
            frame.validate(),
            Err(FrameError::NonFinitePredicate { .. })
        ));
    }

    #[test]
    fn apply_provider_fills_missing_pairs_only() {
        let mut frame = Frame::new(0.0)
            .with_body(id("cup"), BodyState::at_rest(Pose::at(0.0, 0.0, 0.81)))
            .with_body(id("table"), BodyState::at_rest(Pose::at(0.0, 0.0, 0.80)))
            .with_pair(pair("hand", "cup"), PairPredicates::apart(0.3));

        frame.apply_provider(
            &ProximityProvider::default(),
            &[pair("cup", "table"), pair("hand", "cup"), pair("ghost", "cup")],
        );

        assert!(frame.pair(&pair("cup", "table")).unwrap().contact);
        assert!(!frame.pair(&pair("hand", "cup")).unwrap().contact);
        assert!(frame.pair(&pair("ghost", "cup")).is_none());
    }

    #[test]
    fn apply_provider_keeps_native_pair_in_either_order() {
        let mut frame = Frame::new(0.0)
            .with_body(id("cup"), BodyState::at_rest(Pose::at(0.0, 0.0, 0.81)))
            .with_body(id("table"), BodyState::at_rest(Pose::at(0.0, 0.0, 0.80)))
            .with_pair(pair("table", "cup"), PairPredicates::apart(0.3));

        frame.apply_provider(&ProximityProvider::default(), &[pair("cup", "table")]);

        assert!(frame.pair(&pair("cup", "table")).is_none());
        assert_eq!(frame.contact(&pair("cup", "table")), Some(false));
    }

    #[test]
    fn contact_reads_both_orders() {
        let frame = Frame::new(0.0)
            .with_pair(pair("hand", "cup"), PairPredicates::apart(0.1))
            .with_pair(pair("cup", "hand"), PairPredicates::touching());

        assert_eq!(frame.contact(&pair("hand", "cup")), Some(true));
        assert_eq!(frame.contact(&pair("cup", "hand")), Some(true));
        assert_eq!(frame.contact(&pair("cup", "table")), None);
    }

    #[test]
    fn entity_ids_include_pair_members() {
        let frame = Frame::new(0.0)
            .with_body(id("cup"), BodyState::default())
            .with_pair(pair("hand", "cup"), PairPredicates::touching());
        let ids: Vec<&str> = frame.entity_ids().map(EntityId::as_str).collect();
        assert_eq!(ids, vec!["cup", "hand", "cup"]);
    }
}
