//! Deterministic rule-based arm scoring.
//!
//! Used at full weight while an arm is cold and as the control policy of
//! rules-only cohorts, so it has to produce sensible plans on its own.

use formlern_core::{Arm, ArmScorer, Category, Context, FeatureKey, Goal, Intensity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fatigue level from which medium and high intensities are penalized.
pub const HIGH_FATIGUE: f64 = 7.0;
/// Days without any training after which a medium session is preferred.
pub const LONG_BREAK_DAYS: f64 = 3.0;

/// Component weights; normalized by their sum when scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicWeights {
    pub readiness: f64,
    pub goal: f64,
    pub recency: f64,
    pub fatigue: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            readiness: 0.4,
            goal: 0.2,
            recency: 0.2,
            fatigue: 0.2,
        }
    }
}

impl HeuristicWeights {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let w = [self.readiness, self.goal, self.recency, self.fatigue];
        w.iter().all(|x| x.is_finite() && *x >= 0.0) && w.iter().sum::<f64>() > 0.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    weights: HeuristicWeights,
}

impl HeuristicScorer {
    #[must_use]
    pub fn new(weights: HeuristicWeights) -> Self {
        Self { weights }
    }

    /// Intensity level the readiness score supports.
    #[must_use]
    pub fn target_intensity(readiness: f64) -> Intensity {
        if readiness < 40.0 {
            Intensity::None
        } else if readiness < 60.0 {
            Intensity::Low
        } else if readiness < 80.0 {
            Intensity::Medium
        } else {
            Intensity::High
        }
    }

    fn readiness_fit(ctx: &Context, arm: &Arm) -> f64 {
        let Some(readiness) = ctx.number(FeatureKey::Readiness) else {
            return 0.5;
        };
        let target = f64::from(Self::target_intensity(readiness).level());
        let level = f64::from(arm.intensity.level());
        1.0 - (level - target).abs() / 3.0
    }

    fn goal_alignment(ctx: &Context, arm: &Arm) -> f64 {
        match (ctx.goal, arm.category) {
            (Some(Goal::Strength), Category::Strength)
            | (Some(Goal::Endurance | Goal::FatLoss), Category::Cardio) => 1.0,
            (Some(Goal::FatLoss), Category::Strength) => 0.8,
            (Some(Goal::Strength), Category::Cardio) | (Some(Goal::Endurance), Category::Strength) => 0.4,
            (Some(Goal::General) | None, _) => 0.5,
            (_, Category::Recovery) => 0.3,
            (_, Category::Rest) => 0.2,
        }
    }

    fn recency(ctx: &Context, arm: &Arm) -> f64 {
        let days = |key| ctx.number(key).unwrap_or(0.0);
        let since_training = days(FeatureKey::DaysSinceTraining);
        let variety = match arm.category {
            Category::Strength => days(FeatureKey::DaysSinceStrength).min(4.0) / 4.0,
            Category::Cardio => days(FeatureKey::DaysSinceCardio).min(3.0) / 3.0,
            Category::Rest | Category::Recovery => 1.0 - since_training.min(3.0) / 3.0,
        };
        if since_training < LONG_BREAK_DAYS {
            return variety;
        }
        let comeback = match arm.intensity {
            Intensity::Medium => 1.0,
            Intensity::Low => 0.6,
            Intensity::High => 0.3,
            Intensity::None => 0.0,
        };
        0.5 * variety + 0.5 * comeback
    }

    fn fatigue(ctx: &Context, arm: &Arm) -> f64 {
        let Some(fatigue) = ctx.number(FeatureKey::Fatigue) else {
            return 0.5;
        };
        if fatigue >= HIGH_FATIGUE {
            return match (arm.category, arm.intensity) {
                (Category::Recovery, _) => 1.0,
                (Category::Rest, _) => 0.8,
                (_, Intensity::None | Intensity::Low) => 0.5,
                (_, Intensity::Medium) => 0.2,
                (_, Intensity::High) => 0.0,
            };
        }
        1.0 - (fatigue.min(10.0) / 10.0) * (f64::from(arm.intensity.level()) / 3.0)
    }
}

impl ArmScorer for HeuristicScorer {
    fn score(&self, ctx: &Context, arm: &Arm) -> f64 {
        let w = &self.weights;
        let total = w.readiness + w.goal + w.recency + w.fatigue;
        if !(total.is_finite() && total > 0.0) {
            return 0.5;
        }
        let weighted = w.readiness * Self::readiness_fit(ctx, arm)
            + w.goal * Self::goal_alignment(ctx, arm)
            + w.recency * Self::recency(ctx, arm)
            + w.fatigue * Self::fatigue(ctx, arm);
        (weighted / total).clamp(0.0, 1.0)
    }

    fn required_features(&self) -> BTreeSet<FeatureKey> {
        BTreeSet::from([
            FeatureKey::Readiness,
            FeatureKey::Fatigue,
            FeatureKey::DaysSinceTraining,
            FeatureKey::DaysSinceStrength,
            FeatureKey::DaysSinceCardio,
        ])
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use formlern_core::{ArmCatalog, ContextSchema, FeatureSnapshot};

    fn ctx(readiness: i32, fatigue: i32, since_training: i32) -> Context {
        let snap = FeatureSnapshot::new("u")
            .with(FeatureKey::Readiness, readiness)
            .with(FeatureKey::Fatigue, fatigue)
            .with(FeatureKey::DaysSinceTraining, since_training)
            .with(FeatureKey::DaysSinceStrength, 2)
            .with(FeatureKey::DaysSinceCardio, 2);
        ContextSchema::default().validate(&snap).expect("valid")
    }

    fn best(scorer: &HeuristicScorer, ctx: &Context) -> String {
        let catalog = ArmCatalog::standard();
        let mut best: Option<(&str, f64)> = None;
        for arm in catalog.arms() {
            let s = scorer.score(ctx, arm);
            if best.map_or(true, |(_, b)| s > b) {
                best = Some((arm.id.as_str(), s));
            }
        }
        best.map(|(id, _)| id.to_string()).expect("non-empty catalog")
    }

    #[test]
    fn low_readiness_prefers_rest() {
        let scorer = HeuristicScorer::default();
        assert_eq!(best(&scorer, &ctx(30, 3, 1)), "rest");
    }

    #[test]
    fn high_fatigue_prefers_recovery() {
        let scorer = HeuristicScorer::default();
        assert_eq!(best(&scorer, &ctx(55, 8, 1)), "active_recovery");
    }

    #[test]
    fn fresh_athlete_gets_hard_session() {
        let scorer = HeuristicScorer::default();
        let winner = best(&scorer, &ctx(90, 2, 1));
        assert!(winner.ends_with("_high"), "got {winner}");
    }

    #[test]
    fn long_break_boosts_medium_sessions() {
        let scorer = HeuristicScorer::default();
        let catalog = ArmCatalog::standard();
        let c = ctx(85, 2, 5);
        let medium = scorer.score(&c, catalog.get("cardio_medium").expect("arm"));
        let high = scorer.score(&c, catalog.get("cardio_high").expect("arm"));
        let c_recent = ctx(85, 2, 1);
        let medium_recent = scorer.score(&c_recent, catalog.get("cardio_medium").expect("arm"));
        assert!(medium > medium_recent);
        assert!(high - medium < 0.1);
    }

    #[test]
    fn scores_are_deterministic_and_bounded() {
        let scorer = HeuristicScorer::default();
        let catalog = ArmCatalog::standard();
        let c = ctx(63, 5, 2);
        for arm in catalog.arms() {
            let a = scorer.score(&c, arm);
            let b = scorer.score(&c, arm);
            assert!((a - b).abs() < f64::EPSILON);
            assert!((0.0..=1.0).contains(&a));
        }
    }

    #[test]
    fn goal_shifts_preference() {
        let scorer = HeuristicScorer::default();
        let catalog = ArmCatalog::standard();
        let strength = ctx(70, 3, 1);
        let mut endurance = strength.clone();
        endurance.goal = Some(Goal::Endurance);
        let mut lifter = strength;
        lifter.goal = Some(Goal::Strength);
        let arm = catalog.get("strength_medium").expect("arm");
        assert!(scorer.score(&lifter, arm) > scorer.score(&endurance, arm));
    }
}
