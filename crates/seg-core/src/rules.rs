//! Declarative activity rule table.
//!
//! Rules are plain data, deserializable from TOML or JSON, and interpreted by
//! the fixed matcher in [`crate::classifier`]. Adding an activity never needs
//! code.
//!
//! ```toml
//! [[activity_rules]]
//! name = "pick"
//! priority = 10
//! steps = [
//!   { event = "contact_start", roles = ["actor", "object"] },
//!   { event = "motion_start", roles = ["object"], within = 1.0 },
//!   { event = "contact_end", roles = ["object", "surface"], within = 3.0 },
//! ]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::relation::EventKind;
use crate::types::EntityKind;

/// One step of a rule: an episode boundary of a given kind, with role bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStep {
    /// Which boundary of which relation this step matches.
    pub event: EventKind,

    /// Role names bound to the episode's subject: two for pair relations
    /// (subject order), one for single-entity relations.
    pub roles: Vec<String>,

    /// Maximum seconds after the previous step's boundary. Required on every
    /// step but the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<f64>,
}

impl RuleStep {
    pub fn new(event: EventKind, roles: &[&str], within: Option<f64>) -> Self {
        Self {
            event,
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            within,
        }
    }
}

/// A named activity pattern over episode boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRule {
    pub name: String,

    /// Higher priorities win when matches compete for the same episodes.
    #[serde(default)]
    pub priority: i32,

    /// Optional semantic kind each role must have.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_kinds: BTreeMap<String, EntityKind>,

    pub steps: Vec<RuleStep>,
}

impl ActivityRule {
    /// Longest time the rule can span from its first to its last boundary.
    pub fn span(&self) -> f64 {
        self.steps.iter().filter_map(|s| s.within).sum()
    }

    /// Every role name the rule binds, in first-use order.
    pub fn roles(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut roles = Vec::new();
        for role in self.steps.iter().flat_map(|s| s.roles.iter()) {
            if seen.insert(role.as_str()) {
                roles.push(role.as_str());
            }
        }
        roles
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRule {
            rule: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("rule name cannot be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("rule needs at least one step".to_string()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            let relation = step.event.relation();
            let expected = if relation.is_pairwise() { 2 } else { 1 };
            if step.roles.len() != expected {
                return Err(invalid(format!(
                    "step {index} ({}) binds {} roles, {relation} needs {expected}",
                    step.event,
                    step.roles.len()
                )));
            }
            if step.roles.iter().any(|r| r.trim().is_empty()) {
                return Err(invalid(format!("step {index} has an empty role name")));
            }
            if expected == 2 && step.roles[0] == step.roles[1] {
                return Err(invalid(format!(
                    "step {index} binds role {} to both entities",
                    step.roles[0]
                )));
            }
            match (index, step.within) {
                (0, Some(_)) => {
                    return Err(invalid("the first step cannot have a within bound".to_string()));
                }
                (0, None) => {}
                (_, None) => {
                    return Err(invalid(format!("step {index} needs a within bound")));
                }
                (_, Some(within)) if !within.is_finite() || within < 0.0 => {
                    return Err(invalid(format!(
                        "step {index} has invalid within bound {within}"
                    )));
                }
                (_, Some(_)) => {}
            }
        }

        let roles = self.roles();
        if let Some(unknown) = self
            .role_kinds
            .keys()
            .find(|role| !roles.contains(&role.as_str()))
        {
            return Err(invalid(format!(
                "role_kinds names role {unknown} which no step binds"
            )));
        }

        Ok(())
    }
}

/// The pick-up and placing patterns.
pub fn default_rules() -> Vec<ActivityRule> {
    vec![
        ActivityRule {
            name: "pick".to_string(),
            priority: 10,
            role_kinds: BTreeMap::new(),
            steps: vec![
                RuleStep::new(EventKind::ContactStart, &["actor", "object"], None),
                RuleStep::new(EventKind::MotionStart, &["object"], Some(1.0)),
                RuleStep::new(EventKind::ContactEnd, &["object", "surface"], Some(3.0)),
            ],
        },
        ActivityRule {
            name: "place".to_string(),
            priority: 10,
            role_kinds: BTreeMap::new(),
            steps: vec![
                RuleStep::new(EventKind::ContactStart, &["object", "surface"], None),
                RuleStep::new(EventKind::MotionStop, &["object"], Some(1.0)),
                RuleStep::new(EventKind::ContactEnd, &["actor", "object"], Some(3.0)),
            ],
        },
    ]
}
