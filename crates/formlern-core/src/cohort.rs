//! Experiment cohorts.

use serde::{Deserialize, Serialize};

/// How decisions inside a cohort are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CohortPolicy {
    /// Rule score blended with the bandit score.
    #[default]
    Hybrid,
    /// Rule score only; bandit weight pinned to zero (control group).
    RulesOnly,
}

/// The A/B group a request was assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cohort {
    pub experiment: String,
    pub name: String,
    #[serde(default)]
    pub policy: CohortPolicy,
}
