//! Engine configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relation::Relation;
use crate::rules::{ActivityRule, default_rules};

/// Configuration errors, raised when a [`SegmenterConfig`] is validated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A threshold was negative or not finite.
    #[error("{field} must be a finite, non-negative number, got {value}")]
    InvalidThreshold { field: &'static str, value: f64 },

    /// An activity rule is malformed.
    #[error("invalid rule {rule}: {message}")]
    InvalidRule { rule: String, message: String },

    /// Two rules share a name.
    #[error("duplicate rule name: {0}")]
    DuplicateRule(String),

    /// The look-back window cannot cover a rule.
    #[error("max_lookback_window {window}s is shorter than rule {rule} ({span}s)")]
    LookbackTooShort { window: f64, rule: String, span: f64 },

    /// The classifier window cap must allow at least one episode.
    #[error("max_window_episodes must be at least 1")]
    EmptyWindow,
}

/// Thresholds and tables driving detection, aggregation and classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Shortest run of positive samples, in seconds, that confirms an episode.
    /// Default: 0.0.
    pub min_event_duration: f64,

    /// Linear speed (m/s) above which a body is moving. Default: 0.02.
    pub velocity_threshold: f64,

    /// Angular speed (rad/s) above which a body is rotating. Default: 0.2.
    pub angular_velocity_threshold: f64,

    /// Consecutive samples needed to switch a detector on or off. Values of 0
    /// or 1 make detectors binary. Default: 1.
    pub hysteresis_frames: u32,

    /// Longest silence, in seconds, before open episodes are truncated.
    /// Default: 0.5.
    pub gap_tolerance: f64,

    /// Relations an entity may hold with several partners at once.
    /// Default: contact, motion, rotation.
    pub concurrent_relations: BTreeSet<Relation>,

    /// Activity rules, in declaration order.
    pub activity_rules: Vec<ActivityRule>,

    /// Classifier look-back in seconds. Defaults to the longest rule span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lookback_window: Option<f64>,

    /// Hard cap on episodes the classifier retains. Default: 4096.
    pub max_window_episodes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_event_duration: 0.0,
            velocity_threshold: 0.02,
            angular_velocity_threshold: 0.2,
            hysteresis_frames: 1,
            gap_tolerance: 0.5,
            concurrent_relations: [Relation::Contact, Relation::Motion, Relation::Rotation]
                .into_iter()
                .collect(),
            activity_rules: default_rules(),
            max_lookback_window: None,
            max_window_episodes: 4096,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("min_event_duration", self.min_event_duration),
            ("velocity_threshold", self.velocity_threshold),
            ("angular_velocity_threshold", self.angular_velocity_threshold),
            ("gap_tolerance", self.gap_tolerance),
        ] {
            check_threshold(field, value)?;
        }
        if let Some(window) = self.max_lookback_window {
            check_threshold("max_lookback_window", window)?;
        }
        if self.max_window_episodes == 0 {
            return Err(ConfigError::EmptyWindow);
        }

        let mut names = BTreeSet::new();
        for rule in &self.activity_rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
            if let Some(window) = self.max_lookback_window {
                let span = rule.span();
                if window < span {
                    return Err(ConfigError::LookbackTooShort {
                        window,
                        rule: rule.name.clone(),
                        span,
                    });
                }
            }
        }
        Ok(())
    }

    /// Effective classifier look-back in seconds.
    pub fn lookback_window(&self) -> f64 {
        self.max_lookback_window.unwrap_or_else(|| {
            self.activity_rules
                .iter()
                .map(ActivityRule::span)
                .fold(0.0, f64::max)
        })
    }

    pub fn is_concurrent(&self, relation: Relation) -> bool {
        self.concurrent_relations.contains(&relation)
    }
}

fn check_threshold(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidThreshold { field, value });
    }
    Ok(())
}
