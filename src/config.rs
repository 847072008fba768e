//! Engine configuration.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial JSON
//! document only overrides what it names. Deployments usually configure the
//! engine through environment variables instead (see [`EngineConfig::from_env`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::scan_profile::ScanLevel;

/// Errors raised while loading or validating configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The scan level scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Highest declarable level.
    pub max: ScanLevel,
    /// Level of objects with neither a declared nor an inherited profile.
    pub default: ScanLevel,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            max: ScanLevel::new(4),
            default: ScanLevel::L0,
        }
    }
}

/// What happens to edges that touch a retracted object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Edges owned by other origins stay in place.
    #[default]
    Retain,
    /// Every live edge touching the retracted object is retracted as well.
    RetractOrphanedEdges,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub cascade: CascadePolicy,
    /// Applies to unavailable-store retries and to re-planning after a failed match.
    pub retry: RetryPolicy,
}

/// Which way a relation carries inherited levels.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Source to target.
    Forward,
    /// Target to source.
    Backward,
    #[default]
    Both,
}

impl Direction {
    /// Returns true if levels flow from the edge source to the target.
    #[must_use]
    pub const fn forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    /// Returns true if levels flow from the edge target to the source.
    #[must_use]
    pub const fn backward(self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }
}

/// Inheritance rule for one relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationRule {
    #[allow(missing_docs)]
    pub relation: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub direction: Direction,
    /// Levels lost per hop; falls back to the default decay.
    #[serde(default)]
    pub decay: Option<u8>,
    /// Highest level the edge source passes on to its target.
    #[serde(default)]
    pub max_issue: Option<ScanLevel>,
    /// Highest level the edge source takes over from its target.
    #[serde(default)]
    pub max_inherit: Option<ScanLevel>,
}

/// How one relation carries levels, with defaults filled in.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRule {
    pub direction: Direction,
    pub decay: u8,
    pub max_issue: Option<ScanLevel>,
    pub max_inherit: Option<ScanLevel>,
}

impl EdgeRule {
    /// Cap on a level crossing the edge source to target when `forward`,
    /// target to source otherwise.
    #[must_use]
    pub const fn cap(&self, forward: bool) -> Option<ScanLevel> {
        if forward {
            self.max_issue
        } else {
            self.max_inherit
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Hop limit for inheritance.
    pub max_depth: u32,
    /// Decay for relations without an explicit rule.
    pub default_decay: u8,
    /// Node limit for region and source search before falling back to a partial pass.
    pub node_budget: usize,
    pub rules: Vec<PropagationRule>,
    pub retry: RetryPolicy,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            default_decay: 0,
            node_budget: 100_000,
            rules: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PropagationConfig {
    /// Direction, decay and level caps that apply to `relation`.
    #[must_use]
    pub fn rule_for(&self, relation: &str) -> EdgeRule {
        match self.rules.iter().find(|r| r.relation == relation) {
            Some(rule) => EdgeRule {
                direction: rule.direction,
                decay: rule.decay.unwrap_or(self.default_decay),
                max_issue: rule.max_issue,
                max_inherit: rule.max_inherit,
            },
            None => EdgeRule {
                direction: Direction::Both,
                decay: self.default_decay,
                max_issue: None,
                max_inherit: None,
            },
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub increments_topic: String,
    pub mutations_topic: String,
    /// Graph change events are only published when a topic is set.
    pub graph_changes_topic: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            increments_topic: "scan_profile_increments".to_string(),
            mutations_topic: "scan_profile_mutations".to_string(),
            graph_changes_topic: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bounded job queue; a full queue blocks the submitting writer.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalculationConfig {
    pub interval_secs: u64,
}

impl Default for RecalculationConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl RecalculationConfig {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Top-level configuration aggregating all component configs.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub levels: LevelConfig,
    pub reconcile: ReconcileConfig,
    pub propagation: PropagationConfig,
    pub publisher: PublisherConfig,
    pub worker: WorkerConfig,
    pub recalculation: RecalculationConfig,
}

impl EngineConfig {
    /// Load config from a JSON string, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and `ConfigError::Invalid`
    /// for an inconsistent configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by process environment variables.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for:
    /// `SCAN_LEVEL_RECALCULATION_INTERVAL` (seconds), `SCAN_LEVEL_MAX`,
    /// `SCAN_LEVEL_DEFAULT`, `SCAN_PROFILE_MAX_DEPTH`, `SCAN_PROFILE_DEFAULT_DECAY`,
    /// `SCAN_PROFILE_NODE_BUDGET`, `SCAN_PROFILE_CASCADE` (`retain` or
    /// `retract_orphaned_edges`) and `PUBLISH_MAX_ATTEMPTS`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unparsable variable and
    /// `ConfigError::Invalid` for an inconsistent result.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "SCAN_LEVEL_RECALCULATION_INTERVAL")? {
            config.recalculation.interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SCAN_LEVEL_MAX")? {
            config.levels.max = ScanLevel::new(v);
        }
        if let Some(v) = parse_var(&lookup, "SCAN_LEVEL_DEFAULT")? {
            config.levels.default = ScanLevel::new(v);
        }
        if let Some(v) = parse_var(&lookup, "SCAN_PROFILE_MAX_DEPTH")? {
            config.propagation.max_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "SCAN_PROFILE_DEFAULT_DECAY")? {
            config.propagation.default_decay = v;
        }
        if let Some(v) = parse_var(&lookup, "SCAN_PROFILE_NODE_BUDGET")? {
            config.propagation.node_budget = v;
        }
        if let Some(raw) = lookup("SCAN_PROFILE_CASCADE") {
            config.reconcile.cascade = match raw.trim() {
                "retain" => CascadePolicy::Retain,
                "retract_orphaned_edges" => CascadePolicy::RetractOrphanedEdges,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "SCAN_PROFILE_CASCADE".to_string(),
                        value: raw,
                    })
                }
            };
        }
        if let Some(v) = parse_var(&lookup, "PUBLISH_MAX_ATTEMPTS")? {
            config.publisher.retry.max_attempts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.default > self.levels.max {
            return Err(ConfigError::Invalid(format!(
                "default level {} exceeds max level {}",
                self.levels.default, self.levels.max
            )));
        }
        if self.propagation.max_depth == 0 {
            return Err(ConfigError::Invalid("propagation max_depth must be at least 1".to_string()));
        }
        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::Invalid("worker queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.levels.max, ScanLevel::new(4));
        assert_eq!(config.levels.default, ScanLevel::L0);
        assert_eq!(config.propagation.max_depth, 8);
        assert_eq!(config.propagation.node_budget, 100_000);
        assert_eq!(config.reconcile.cascade, CascadePolicy::Retain);
        assert_eq!(config.publisher.increments_topic, "scan_profile_increments");
        assert_eq!(config.publisher.mutations_topic, "scan_profile_mutations");
        assert_eq!(config.recalculation.interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "propagation": {
                    "max_depth": 3,
                    "rules": [
                        {"relation": "resolves_to", "direction": "forward", "decay": 1},
                        {"relation": "ip_service", "max_issue": 0, "max_inherit": 4}
                    ]
                },
                "reconcile": {"cascade": "retract_orphaned_edges"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.propagation.max_depth, 3);
        assert_eq!(config.propagation.node_budget, 100_000);
        assert_eq!(config.reconcile.cascade, CascadePolicy::RetractOrphanedEdges);
        let resolves = config.propagation.rule_for("resolves_to");
        assert_eq!((resolves.direction, resolves.decay), (Direction::Forward, 1));
        assert_eq!(resolves.cap(true), None);
        let service = config.propagation.rule_for("ip_service");
        assert_eq!(service.direction, Direction::Both);
        assert_eq!(service.cap(true), Some(ScanLevel::L0));
        assert_eq!(service.cap(false), Some(ScanLevel::new(4)));
        let other = config.propagation.rule_for("has_port");
        assert_eq!((other.direction, other.decay), (Direction::Both, 0));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SCAN_LEVEL_RECALCULATION_INTERVAL", "15"),
            ("SCAN_PROFILE_MAX_DEPTH", "2"),
            ("SCAN_PROFILE_CASCADE", "retract_orphaned_edges"),
            ("PUBLISH_MAX_ATTEMPTS", "9"),
        ]);
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.recalculation.interval_secs, 15);
        assert_eq!(config.propagation.max_depth, 2);
        assert_eq!(config.reconcile.cascade, CascadePolicy::RetractOrphanedEdges);
        assert_eq!(config.publisher.retry.max_attempts, 9);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = EngineConfig::from_lookup(|k| (k == "SCAN_LEVEL_MAX").then(|| "four".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = EngineConfig::from_lookup(|k| (k == "SCAN_PROFILE_CASCADE").then(|| "drop".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_rejects_inconsistent_levels() {
        let mut config = EngineConfig::default();
        config.levels.default = ScanLevel::new(5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.propagation.max_depth = 0;
        assert!(config.validate().is_err());
    }
}
