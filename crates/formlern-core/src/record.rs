//! Decision records, the append-only output of the decision engine.
//!
//! A record carries everything the coaching layer needs to explain a
//! recommendation (per-arm scores, vetoes, forced defaults) and everything the
//! update path needs to attribute feedback (selected arm, cluster, context).

use crate::arm::ArmId;
use crate::cohort::Cohort;
use crate::context::Context;
use serde::{Deserialize, Serialize};

/// Index of a context cluster; `0` when clustering is disabled.
pub type ClusterId = u16;

/// Per-request pipeline stages, recorded in order of traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Received,
    SafetyFiltered,
    Scored,
    Blended,
    Selected,
    Emitted,
}

/// Scores of one eligible arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmScore {
    pub arm: ArmId,
    /// Heuristic score in `[0, 1]`.
    pub rule: f64,
    /// Thompson sample, absent when the bandit weight is zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandit: Option<f64>,
    pub bandit_weight: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
    /// Outcomes observed for this arm in the decision's cluster.
    pub observations: u64,
}

/// An arm removed by a safety rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Veto {
    pub arm: ArmId,
    pub rule: String,
    pub reason: String,
}

/// The safety rule that short-circuited scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedDefault {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Every candidate was vetoed; the safe default was returned instead.
    AllArmsVetoed,
}

/// A posterior that failed validation while the decision snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultNote {
    pub arm: ArmId,
    pub cluster: ClusterId,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub ts: String,
    pub user_key: String,
    pub context: Context,
    pub selected: ArmId,
    /// Eligible arms, best first.
    pub scores: Vec<ArmScore>,
    #[serde(default)]
    pub vetoes: Vec<Veto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_default: Option<ForcedDefault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Fallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<Cohort>,
    pub cluster: ClusterId,
    pub catalog_version: String,
    pub config_version: String,
    /// Seed of the sampling RNG; replaying with it reproduces the decision.
    pub seed: u64,
    /// Posterior store version the decision observed.
    pub snapshot_version: u64,
    pub stages: Vec<DecisionStage>,
    pub elapsed_us: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<FaultNote>,
}

impl DecisionRecord {
    #[must_use]
    pub fn is_vetoed(&self, arm: &ArmId) -> bool {
        self.vetoes.iter().any(|v| &v.arm == arm)
    }

    #[must_use]
    pub fn score_of(&self, arm: &ArmId) -> Option<&ArmScore> {
        self.scores.iter().find(|s| &s.arm == arm)
    }
}
