//! Deterministic A/B cohort assignment.
//!
//! No state is persisted: a user lands in the same cohort on every call, on
//! every host, as long as the experiment definition is unchanged.

use crate::hash::stable_hash64;
use formlern_core::{Cohort, CohortPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSpec {
    pub name: String,
    /// Relative share of users; weights need not sum to one.
    pub weight: f64,
    #[serde(default)]
    pub policy: CohortPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    pub cohorts: Vec<CohortSpec>,
}

impl ExperimentConfig {
    /// Two-cohort experiment: `treatment` runs the hybrid policy, `control`
    /// the rules-only policy, split evenly.
    #[must_use]
    pub fn hybrid_vs_rules(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cohorts: vec![
                CohortSpec {
                    name: "treatment".to_string(),
                    weight: 0.5,
                    policy: CohortPolicy::Hybrid,
                },
                CohortSpec {
                    name: "control".to_string(),
                    weight: 0.5,
                    policy: CohortPolicy::RulesOnly,
                },
            ],
        }
    }

    /// Reason the experiment is unusable, if any.
    #[must_use]
    pub fn problem(&self) -> Option<String> {
        if self.cohorts.is_empty() {
            return Some(format!("experiment '{}' has no cohorts", self.id));
        }
        if let Some(c) = self
            .cohorts
            .iter()
            .find(|c| !c.weight.is_finite() || c.weight < 0.0)
        {
            return Some(format!("cohort '{}' has invalid weight {}", c.name, c.weight));
        }
        if self.cohorts.iter().map(|c| c.weight).sum::<f64>() <= 0.0 {
            return Some(format!("experiment '{}' has zero total weight", self.id));
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentAllocator {
    experiments: Vec<ExperimentConfig>,
}

impl ExperimentAllocator {
    #[must_use]
    pub fn new(experiments: Vec<ExperimentConfig>) -> Self {
        Self { experiments }
    }

    #[must_use]
    pub fn experiment(&self, id: &str) -> Option<&ExperimentConfig> {
        self.experiments.iter().find(|e| e.id == id)
    }

    /// Cohort of `user_key` in `experiment_id`; `None` for unknown or
    /// unusable experiments.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn assign(&self, user_key: &str, experiment_id: &str) -> Option<Cohort> {
        let experiment = self.experiment(experiment_id)?;
        if experiment.problem().is_some() {
            return None;
        }
        let total: f64 = experiment.cohorts.iter().map(|c| c.weight).sum();
        let seed = stable_hash64(0, experiment_id);
        // 53 high bits give a uniform f64 in [0, 1).
        let unit = (stable_hash64(seed, user_key) >> 11) as f64 / (1_u64 << 53) as f64;
        let point = unit * total;

        let mut acc = 0.0;
        let chosen = experiment
            .cohorts
            .iter()
            .find(|c| {
                acc += c.weight;
                point < acc
            })
            .or_else(|| experiment.cohorts.iter().rev().find(|c| c.weight > 0.0))?;
        Some(Cohort {
            experiment: experiment.id.clone(),
            name: chosen.name.clone(),
            policy: chosen.policy,
        })
    }
}
