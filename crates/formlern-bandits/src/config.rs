//! Versioned engine configuration.
//!
//! Every field has a default, so `{}` is a valid configuration that yields
//! the standard catalog, rule set and priors.

use crate::allocator::ExperimentConfig;
use crate::blend::BlendConfig;
use crate::heuristic::HeuristicWeights;
use crate::posterior::PriorConfig;
use crate::reward::RewardWeights;
use crate::safety::RuleSet;
use crate::thompson::Clustering;
use formlern_core::{ArmCatalog, CatalogError, CatalogSpec, FeatureKey, FeatureKind, FeatureValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Where the sampling seed of a decision comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Fresh random seed per request.
    #[default]
    Randomized,
    /// Seed derived from the request id; a retried request gets the same plan.
    PerRequestSeeded,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("invalid prior: {0}")]
    InvalidPrior(String),
    #[error("invalid blend settings: {0}")]
    InvalidBlend(String),
    #[error("invalid experiment: {0}")]
    InvalidExperiment(String),
    #[error("invalid clustering: {0}")]
    InvalidClustering(String),
    #[error("invalid reward weights")]
    InvalidReward,
    #[error("invalid heuristic weights")]
    InvalidScorer,
    #[error("invalid default for '{key}': expected a {expected}")]
    InvalidDefault { key: FeatureKey, expected: &'static str },
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub version: String,
    pub catalog: CatalogSpec,
    pub prior: PriorConfig,
    pub blend: BlendConfig,
    pub rules: RuleSet,
    /// Values substituted for absent features, marked `defaulted` in the context.
    pub context_defaults: BTreeMap<FeatureKey, FeatureValue>,
    pub clustering: Clustering,
    pub reward: RewardWeights,
    pub scorer: HeuristicWeights,
    pub experiments: Vec<ExperimentConfig>,
    /// Experiment used when a request carries no cohort override.
    pub active_experiment: Option<String>,
    pub sampling: SamplingMode,
    pub latency_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "formlern-1".to_string(),
            catalog: CatalogSpec::default(),
            prior: PriorConfig::default(),
            blend: BlendConfig::default(),
            rules: RuleSet::standard(),
            context_defaults: standard_defaults(),
            clustering: Clustering::default(),
            reward: RewardWeights::default(),
            scorer: HeuristicWeights::default(),
            experiments: Vec::new(),
            active_experiment: None,
            sampling: SamplingMode::default(),
            latency_budget_ms: 50,
        }
    }
}

/// Defaults for features wearables often miss. Physiological readings the
/// safety rules depend on (readiness, HRV, sleep, resting HR) have none.
fn standard_defaults() -> BTreeMap<FeatureKey, FeatureValue> {
    BTreeMap::from([
        (FeatureKey::InjuryFlag, FeatureValue::Flag(false)),
        (FeatureKey::OvertrainingRisk, FeatureValue::Flag(false)),
        (FeatureKey::DaysSinceInjury, FeatureValue::Number(365.0)),
        (FeatureKey::ConsecutiveHighDays, FeatureValue::Number(0.0)),
        (FeatureKey::DaysSinceTraining, FeatureValue::Number(1.0)),
        (FeatureKey::DaysSinceStrength, FeatureValue::Number(7.0)),
        (FeatureKey::DaysSinceCardio, FeatureValue::Number(7.0)),
        (FeatureKey::Fatigue, FeatureValue::Number(5.0)),
        (FeatureKey::Soreness, FeatureValue::Number(1.0)),
    ])
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    /// Malformed JSON or any [`EngineConfig::validate`] failure.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// I/O failure or any [`EngineConfig::from_json_str`] failure.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Builds the catalog this config describes.
    ///
    /// # Errors
    /// See [`ArmCatalog::from_spec`].
    pub fn build_catalog(&self) -> Result<ArmCatalog, ConfigError> {
        Ok(ArmCatalog::from_spec(self.catalog.clone())?)
    }

    /// Rejects configurations the engine cannot run safely with.
    ///
    /// # Errors
    /// The first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_catalog()?;
        self.prior
            .validate()
            .map_err(|e| ConfigError::InvalidPrior(e.to_string()))?;
        if !self.prior.noise_variance.is_finite() || self.prior.noise_variance <= 0.0 {
            return Err(ConfigError::InvalidPrior(format!(
                "noise_variance must be positive, got {}",
                self.prior.noise_variance
            )));
        }
        if !self.blend.is_valid() {
            return Err(ConfigError::InvalidBlend(format!(
                "ceiling {} must lie in [0, 1] and ramps must be positive",
                self.blend.ceiling
            )));
        }
        if !self.clustering.is_valid() {
            return Err(ConfigError::InvalidClustering(
                "readiness band edges must be finite and strictly increasing".to_string(),
            ));
        }
        if !self.reward.is_valid() {
            return Err(ConfigError::InvalidReward);
        }
        if !self.scorer.is_valid() {
            return Err(ConfigError::InvalidScorer);
        }
        for (key, value) in &self.context_defaults {
            if key.kind() != value.kind() {
                let expected = match key.kind() {
                    FeatureKind::Flag => "boolean",
                    FeatureKind::Number => "number",
                };
                return Err(ConfigError::InvalidDefault { key: *key, expected });
            }
        }
        for exp in &self.experiments {
            if let Some(problem) = exp.problem() {
                return Err(ConfigError::InvalidExperiment(problem));
            }
        }
        if let Some(active) = &self.active_experiment {
            if !self.experiments.iter().any(|e| &e.id == active) {
                return Err(ConfigError::InvalidExperiment(format!(
                    "active experiment '{active}' is not defined"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_the_default_config() {
        let config = EngineConfig::from_json_str("{}").expect("valid");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.latency_budget_ms, 50);
        assert_eq!(config.build_catalog().expect("catalog").safe_default().id.as_str(), "active_recovery");
    }

    #[test]
    fn default_config_roundtrips() {
        let json = serde_json::to_string_pretty(&EngineConfig::default()).expect("serialize");
        let back = EngineConfig::from_json_str(&json).expect("parse");
        assert_eq!(back, EngineConfig::default());
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"blend": {"min_observations": 10}, "sampling": "per_request_seeded"}"#,
        )
        .expect("valid");
        assert_eq!(config.blend.min_observations, 10);
        assert!((config.blend.ceiling - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.sampling, SamplingMode::PerRequestSeeded);
    }

    #[test]
    fn ceiling_above_one_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"blend": {"ceiling": 1.2}}"#).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidBlend(_)));
    }

    #[test]
    fn non_positive_prior_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"prior": {"alpha0": 0}}"#).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidPrior(_)));
    }

    #[test]
    fn unknown_safe_default_is_rejected() {
        let mut config = EngineConfig::default();
        config.catalog.safe_default = "sauna".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Catalog(CatalogError::UnknownSafeDefault(_)))
        ));
    }

    #[test]
    fn mistyped_default_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"context_defaults": {"injury_flag": 0}}"#)
            .expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::InvalidDefault {
                key: FeatureKey::InjuryFlag,
                ..
            }
        ));
    }

    #[test]
    fn undefined_active_experiment_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"active_experiment": "ghost"}"#).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidExperiment(_)));
    }
}
