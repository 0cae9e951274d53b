//! Maturity-dependent mix of rule and bandit scores.

use formlern_core::{ArmCatalog, ArmScore};
use serde::{Deserialize, Serialize};

/// Shape of the bandit-weight ramp once an arm has `min_observations`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlendCurve {
    /// Reaches the ceiling after `ramp` observations past the threshold.
    Linear { ramp: u32 },
    /// `ln(1 + m) / ln(1 + ramp)`, steeper early.
    Log { ramp: u32 },
    /// Jumps straight to the ceiling.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    pub min_observations: u64,
    /// Upper bound of the bandit weight, in `[0, 1]`.
    pub ceiling: f64,
    pub curve: BlendCurve,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            min_observations: 5,
            ceiling: 0.8,
            curve: BlendCurve::Linear { ramp: 50 },
        }
    }
}

impl BlendConfig {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let ramp_ok = match self.curve {
            BlendCurve::Linear { ramp } | BlendCurve::Log { ramp } => ramp > 0,
            BlendCurve::Step => true,
        };
        ramp_ok && (0.0..=1.0).contains(&self.ceiling)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HybridBlender {
    config: BlendConfig,
}

impl HybridBlender {
    #[must_use]
    pub fn new(config: BlendConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &BlendConfig {
        &self.config
    }

    /// Weight of the bandit score for a cell with `observations` outcomes.
    ///
    /// Zero for an unobserved cell and below `min_observations`, then
    /// non-decreasing up to `ceiling`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bandit_weight(&self, observations: u64) -> f64 {
        let cfg = &self.config;
        if observations == 0 || observations < cfg.min_observations {
            return 0.0;
        }
        let m = (observations - cfg.min_observations + 1) as f64;
        let progress = match cfg.curve {
            BlendCurve::Linear { ramp } => m / f64::from(ramp.max(1)),
            BlendCurve::Log { ramp } => m.ln_1p() / f64::from(ramp.max(1)).ln_1p(),
            BlendCurve::Step => 1.0,
        };
        (progress.min(1.0) * cfg.ceiling).clamp(0.0, cfg.ceiling)
    }

    /// Final score and the bandit weight used for it.
    ///
    /// A missing bandit score (control cohort, cold cell) means rule-only.
    #[must_use]
    pub fn blend(&self, rule: f64, bandit: Option<f64>, observations: u64) -> (f64, f64) {
        match bandit {
            Some(b) => {
                let w = self.bandit_weight(observations);
                ((1.0 - w) * rule + w * b, w)
            }
            None => (rule, 0.0),
        }
    }

    /// Sorts best first. Ties fall back to catalog priority, never chance.
    pub fn rank(&self, scores: &mut [ArmScore], catalog: &ArmCatalog) {
        scores.sort_by(|a, b| {
            b.final_score.total_cmp(&a.final_score).then_with(|| {
                let pa = catalog.priority(a.arm.as_str()).unwrap_or(usize::MAX);
                let pb = catalog.priority(b.arm.as_str()).unwrap_or(usize::MAX);
                pa.cmp(&pb)
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formlern_core::ArmId;

    fn score(arm: &str, final_score: f64) -> ArmScore {
        ArmScore {
            arm: ArmId::from(arm),
            rule: final_score,
            bandit: None,
            bandit_weight: 0.0,
            final_score,
            observations: 0,
        }
    }

    #[test]
    fn cold_arms_use_rule_score_only() {
        let blender = HybridBlender::default();
        assert!(blender.bandit_weight(0).abs() < f64::EPSILON);
        assert!(blender.bandit_weight(4).abs() < f64::EPSILON);
        let (final_score, w) = blender.blend(0.3, Some(0.9), 4);
        assert!((final_score - 0.3).abs() < f64::EPSILON);
        assert!(w.abs() < f64::EPSILON);
    }

    #[test]
    fn weight_is_monotone_and_capped() {
        for curve in [
            BlendCurve::Linear { ramp: 20 },
            BlendCurve::Log { ramp: 20 },
            BlendCurve::Step,
        ] {
            let blender = HybridBlender::new(BlendConfig {
                curve,
                ..BlendConfig::default()
            });
            let mut last = 0.0;
            for n in 0..200 {
                let w = blender.bandit_weight(n);
                assert!(w >= last, "{curve:?} decreased at {n}");
                assert!(w <= 0.8 + f64::EPSILON);
                last = w;
            }
            assert!((last - 0.8).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_threshold_still_keeps_unobserved_cells_cold() {
        let blender = HybridBlender::new(BlendConfig {
            min_observations: 0,
            ..BlendConfig::default()
        });
        assert!(blender.bandit_weight(0).abs() < f64::EPSILON);
        assert!(blender.bandit_weight(1) > 0.0);
        let (final_score, w) = blender.blend(0.3, Some(0.9), 0);
        assert!((final_score - 0.3).abs() < f64::EPSILON);
        assert!(w.abs() < f64::EPSILON);
    }

    #[test]
    fn ceiling_of_zero_disables_the_bandit() {
        let blender = HybridBlender::new(BlendConfig {
            ceiling: 0.0,
            ..BlendConfig::default()
        });
        assert!(blender.bandit_weight(10_000).abs() < f64::EPSILON);
    }

    #[test]
    fn ties_break_by_catalog_priority() {
        let catalog = ArmCatalog::standard();
        let mut scores = vec![
            score("cardio_high", 0.5),
            score("strength_low", 0.7),
            score("rest", 0.5),
        ];
        HybridBlender::default().rank(&mut scores, &catalog);
        let order: Vec<&str> = scores.iter().map(|s| s.arm.as_str()).collect();
        assert_eq!(order, vec!["strength_low", "rest", "cardio_high"]);
    }

    #[test]
    fn invalid_ceiling_is_rejected() {
        let cfg = BlendConfig {
            ceiling: 1.5,
            ..BlendConfig::default()
        };
        assert!(!cfg.is_valid());
        assert!(BlendConfig::default().is_valid());
    }
}
