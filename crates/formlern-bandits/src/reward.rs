//! Outcome-to-reward mapping.

use formlern_core::Outcome;
use serde::{Deserialize, Serialize};

/// Weights of the reward components. Negative weights penalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub completion: f64,
    pub adherence: f64,
    pub satisfaction: f64,
    /// Penalty applied when a completed session was rated at or above `strain_rpe`.
    pub strain: f64,
    pub strain_rpe: f64,
    pub injury: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            completion: 1.0,
            adherence: 0.5,
            satisfaction: 0.3,
            strain: -0.5,
            strain_rpe: 9.0,
            injury: -2.0,
        }
    }
}

impl RewardWeights {
    /// `true` when every weight is finite and the reachable range is non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let all = [
            self.completion,
            self.adherence,
            self.satisfaction,
            self.strain,
            self.strain_rpe,
            self.injury,
        ];
        all.iter().all(|w| w.is_finite()) && {
            let (lo, hi) = self.bounds();
            hi > lo
        }
    }

    /// Lowest and highest raw reward these weights can produce.
    fn bounds(&self) -> (f64, f64) {
        let terms = [self.completion, self.adherence, self.satisfaction, self.strain, self.injury];
        let lo = terms.iter().map(|w| w.min(0.0)).sum();
        let hi = terms.iter().map(|w| w.max(0.0)).sum();
        (lo, hi)
    }
}

/// Maps an [`Outcome`] to a scalar reward in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct RewardFunction {
    weights: RewardWeights,
}

impl RewardFunction {
    #[must_use]
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// Weighted sum of the outcome components, before normalization.
    ///
    /// Missing adherence follows completion; missing satisfaction falls back
    /// to the mood rating (1-5) and then to a neutral 0.5.
    #[must_use]
    pub fn raw(&self, outcome: &Outcome) -> f64 {
        let w = &self.weights;
        let completed = if outcome.completed { 1.0 } else { 0.0 };
        let adherence = outcome
            .adherence
            .filter(|a| a.is_finite())
            .map_or(completed, |a| a.clamp(0.0, 1.0));
        let satisfaction = outcome
            .satisfaction
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 1.0))
            .or_else(|| {
                outcome
                    .mood
                    .filter(|m| m.is_finite())
                    .map(|m| ((m - 1.0) / 4.0).clamp(0.0, 1.0))
            })
            .unwrap_or(0.5);
        let strained = outcome.completed && outcome.rpe.is_some_and(|r| r >= w.strain_rpe);

        let mut reward = w.completion * completed + w.adherence * adherence + w.satisfaction * satisfaction;
        if strained {
            reward += w.strain;
        }
        if outcome.injury {
            reward += w.injury;
        }
        reward
    }

    /// Reward scaled into `[0, 1]` by the reachable range of the weights.
    #[must_use]
    pub fn normalize(&self, outcome: &Outcome) -> f64 {
        let (lo, hi) = self.weights.bounds();
        if hi <= lo {
            return 0.5;
        }
        ((self.raw(outcome) - lo) / (hi - lo)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(completed: bool) -> Outcome {
        Outcome {
            completed,
            ..Outcome::default()
        }
    }

    #[test]
    fn full_success_scores_high() {
        let f = RewardFunction::default();
        let o = Outcome {
            satisfaction: Some(1.0),
            ..outcome(true)
        };
        assert!((f.normalize(&o) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn skipped_session_scores_below_completed_one() {
        let f = RewardFunction::default();
        assert!(f.normalize(&outcome(false)) < f.normalize(&outcome(true)));
    }

    #[test]
    fn injury_dominates() {
        let f = RewardFunction::default();
        let hurt = Outcome {
            injury: true,
            satisfaction: Some(1.0),
            ..outcome(true)
        };
        assert!(f.normalize(&hurt) < f.normalize(&outcome(false)));
    }

    #[test]
    fn mood_stands_in_for_satisfaction() {
        let f = RewardFunction::default();
        let happy = Outcome {
            mood: Some(5.0),
            ..outcome(true)
        };
        let neutral = outcome(true);
        assert!((f.raw(&happy) - f.raw(&neutral) - 0.3 * 0.5).abs() < 1e-12);
    }

    #[test]
    fn high_rpe_costs_reward() {
        let f = RewardFunction::default();
        let hard = Outcome {
            rpe: Some(10.0),
            ..outcome(true)
        };
        assert!((f.raw(&outcome(true)) - f.raw(&hard) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn degenerate_weights_yield_neutral_reward() {
        let f = RewardFunction::new(RewardWeights {
            completion: 0.0,
            adherence: 0.0,
            satisfaction: 0.0,
            strain: 0.0,
            strain_rpe: 9.0,
            injury: 0.0,
        });
        assert!(!f.weights().is_valid());
        assert!((f.normalize(&outcome(true)) - 0.5).abs() < f64::EPSILON);
    }
}
