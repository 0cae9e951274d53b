//! Hard safety constraints.
//!
//! Rules are data: a condition over the context plus an action against arms.
//! The active [`RuleSet`] is an immutable snapshot behind an `ArcSwap`; a
//! reload swaps the whole set in one pointer store, so a decision sees either
//! the old or the new set, never a mix.

use arc_swap::ArcSwap;
use formlern_core::{Arm, Category, Context, FeatureKey, ForcedDefault, Intensity, Veto};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Predicate over the context.
///
/// A referenced feature that is absent never satisfies a comparison; the
/// engine's schema makes every referenced feature mandatory, so this only
/// matters for contexts built outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Above { feature: FeatureKey, value: f64 },
    AtLeast { feature: FeatureKey, value: f64 },
    Below { feature: FeatureKey, value: f64 },
    Flag { feature: FeatureKey },
    Any { of: Vec<Condition> },
    All { of: Vec<Condition> },
}

impl Condition {
    #[must_use]
    pub fn holds(&self, ctx: &Context) -> bool {
        match self {
            Condition::Above { feature, value } => ctx.number(*feature).is_some_and(|v| v > *value),
            Condition::AtLeast { feature, value } => {
                ctx.number(*feature).is_some_and(|v| v >= *value)
            }
            Condition::Below { feature, value } => ctx.number(*feature).is_some_and(|v| v < *value),
            Condition::Flag { feature } => ctx.flag(*feature).unwrap_or(false),
            Condition::Any { of } => of.iter().any(|c| c.holds(ctx)),
            Condition::All { of } => !of.is_empty() && of.iter().all(|c| c.holds(ctx)),
        }
    }

    fn collect_features(&self, out: &mut BTreeSet<FeatureKey>) {
        match self {
            Condition::Above { feature, .. }
            | Condition::AtLeast { feature, .. }
            | Condition::Below { feature, .. }
            | Condition::Flag { feature } => {
                out.insert(*feature);
            }
            Condition::Any { of } | Condition::All { of } => {
                for c in of {
                    c.collect_features(out);
                }
            }
        }
    }
}

/// What a rule does to an arm once its condition holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Skip scoring and return the safe default.
    ForceDefault,
    /// Veto arms above `max`.
    MaxIntensity { max: Intensity },
    /// Veto arms outside `categories` or above `max`.
    AllowOnly {
        categories: Vec<Category>,
        max: Intensity,
    },
    /// Veto arms carrying the contraindication `tag`.
    Contraindicated { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Veto,
    ForceDefault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub name: String,
    pub when: Condition,
    pub action: RuleAction,
    /// Human-readable reason surfaced to the coaching layer.
    pub reason: String,
}

impl SafetyRule {
    #[must_use]
    pub fn verdict(&self, ctx: &Context, arm: &Arm) -> Verdict {
        if !self.when.holds(ctx) {
            return Verdict::Allow;
        }
        let veto = match &self.action {
            RuleAction::ForceDefault => return Verdict::ForceDefault,
            RuleAction::MaxIntensity { max } => arm.intensity > *max,
            RuleAction::AllowOnly { categories, max } => {
                !categories.contains(&arm.category) || arm.intensity > *max
            }
            RuleAction::Contraindicated { tag } => arm.has_tag(tag),
        };
        if veto {
            Verdict::Veto
        } else {
            Verdict::Allow
        }
    }
}

/// Result of gating one candidate set.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// Arms that may be scored, in candidate order.
    pub eligible: Vec<Arc<Arm>>,
    pub vetoed: Vec<Veto>,
    pub forced: Option<ForcedDefault>,
}

impl GateOutcome {
    #[must_use]
    pub fn is_vetoed(&self, arm: &Arm) -> bool {
        self.vetoed.iter().any(|v| v.arm == arm.id)
    }
}

/// A versioned, immutable set of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    pub rules: Vec<SafetyRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleSet {
    /// Every feature a rule condition reads.
    #[must_use]
    pub fn required_features(&self) -> BTreeSet<FeatureKey> {
        let mut out = BTreeSet::new();
        for rule in &self.rules {
            rule.when.collect_features(&mut out);
        }
        out
    }

    /// Applies every rule to every candidate, the safe default included.
    ///
    /// A firing force-default rule short-circuits to exactly the safe default
    /// and lists every other candidate as vetoed. An empty `eligible` list is
    /// left to the caller to resolve.
    #[must_use]
    pub fn evaluate(&self, ctx: &Context, candidates: &[Arc<Arm>], safe_default: &Arc<Arm>) -> GateOutcome {
        let forcing = self.rules.iter().find(|r| {
            matches!(r.action, RuleAction::ForceDefault) && r.when.holds(ctx)
        });
        if let Some(rule) = forcing {
            tracing::warn!(
                rule = %rule.name,
                reason = %rule.reason,
                safe_default = %safe_default.id,
                "safety gate forced default"
            );
            let vetoed = candidates
                .iter()
                .filter(|a| a.id != safe_default.id)
                .map(|a| Veto {
                    arm: a.id.clone(),
                    rule: rule.name.clone(),
                    reason: format!("forced default: {}", rule.reason),
                })
                .collect();
            return GateOutcome {
                eligible: vec![Arc::clone(safe_default)],
                vetoed,
                forced: Some(ForcedDefault {
                    rule: rule.name.clone(),
                    reason: rule.reason.clone(),
                }),
            };
        }

        let mut eligible = Vec::with_capacity(candidates.len());
        let mut vetoed = Vec::new();
        for arm in candidates {
            let before = vetoed.len();
            for rule in &self.rules {
                if rule.verdict(ctx, arm) == Verdict::Veto {
                    tracing::warn!(arm = %arm.id, rule = %rule.name, reason = %rule.reason, "arm vetoed");
                    vetoed.push(Veto {
                        arm: arm.id.clone(),
                        rule: rule.name.clone(),
                        reason: rule.reason.clone(),
                    });
                }
            }
            if vetoed.len() == before {
                eligible.push(Arc::clone(arm));
            }
        }
        GateOutcome {
            eligible,
            vetoed,
            forced: None,
        }
    }

    /// Default rules, thresholds from sports-medicine guardrails.
    #[must_use]
    pub fn standard() -> Self {
        let easy_only = RuleAction::AllowOnly {
            categories: vec![Category::Rest, Category::Recovery],
            max: Intensity::Low,
        };
        let rule = |name: &str, when: Condition, action: RuleAction, reason: &str| SafetyRule {
            name: name.to_string(),
            when,
            action,
            reason: reason.to_string(),
        };
        Self {
            version: "standard-1".to_string(),
            rules: vec![
                rule(
                    "injury_flag",
                    Condition::Flag {
                        feature: FeatureKey::InjuryFlag,
                    },
                    RuleAction::ForceDefault,
                    "Active injury reported",
                ),
                rule(
                    "overtraining_risk",
                    Condition::Flag {
                        feature: FeatureKey::OvertrainingRisk,
                    },
                    RuleAction::ForceDefault,
                    "Multiple indicators suggest excessive training load",
                ),
                rule(
                    "abnormal_resting_hr",
                    Condition::Above {
                        feature: FeatureKey::RestingHr,
                        value: 100.0,
                    },
                    RuleAction::ForceDefault,
                    "Resting heart rate above 100 bpm",
                ),
                rule(
                    "low_hrv_or_sleep",
                    Condition::Any {
                        of: vec![
                            Condition::Below {
                                feature: FeatureKey::Hrv,
                                value: 20.0,
                            },
                            Condition::Below {
                                feature: FeatureKey::SleepHours,
                                value: 4.0,
                            },
                        ],
                    },
                    easy_only.clone(),
                    "Low HRV or insufficient sleep",
                ),
                rule(
                    "high_fatigue",
                    Condition::AtLeast {
                        feature: FeatureKey::Fatigue,
                        value: 8.0,
                    },
                    easy_only.clone(),
                    "High fatigue level",
                ),
                rule(
                    "high_soreness",
                    Condition::AtLeast {
                        feature: FeatureKey::Soreness,
                        value: 8.0,
                    },
                    easy_only,
                    "High muscle soreness",
                ),
                rule(
                    "consecutive_high_load",
                    Condition::AtLeast {
                        feature: FeatureKey::ConsecutiveHighDays,
                        value: 3.0,
                    },
                    RuleAction::MaxIntensity {
                        max: Intensity::Medium,
                    },
                    "Three or more consecutive high-intensity days",
                ),
                rule(
                    "low_readiness",
                    Condition::Below {
                        feature: FeatureKey::Readiness,
                        value: 50.0,
                    },
                    RuleAction::MaxIntensity {
                        max: Intensity::Medium,
                    },
                    "Readiness below 50",
                ),
                rule(
                    "recent_injury",
                    Condition::Below {
                        feature: FeatureKey::DaysSinceInjury,
                        value: 14.0,
                    },
                    RuleAction::Contraindicated {
                        tag: "high_impact".to_string(),
                    },
                    "Injury within the last two weeks",
                ),
            ],
        }
    }
}

/// Holder of the active rule set.
#[derive(Debug)]
pub struct SafetyGate {
    rules: ArcSwap<RuleSet>,
}

impl SafetyGate {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    /// The current rule set. Hold on to the returned `Arc` for the duration of
    /// one decision.
    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Atomically replaces the rule set; returns the previous one.
    pub fn reload(&self, rules: RuleSet) -> Arc<RuleSet> {
        tracing::info!(version = %rules.version, rules = rules.rules.len(), "safety rules reloaded");
        self.rules.swap(Arc::new(rules))
    }

    #[must_use]
    pub fn evaluate(&self, ctx: &Context, candidates: &[Arc<Arm>], safe_default: &Arc<Arm>) -> GateOutcome {
        self.rules().evaluate(ctx, candidates, safe_default)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use formlern_core::{ArmCatalog, ContextSchema, FeatureSnapshot};

    fn ctx(snapshot: FeatureSnapshot) -> Context {
        ContextSchema::default()
            .validate(&snapshot)
            .expect("valid context")
    }

    fn calm() -> FeatureSnapshot {
        FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, 85)
            .with(FeatureKey::Hrv, 65)
            .with(FeatureKey::SleepHours, 8)
            .with(FeatureKey::RestingHr, 52)
            .with(FeatureKey::Fatigue, 3)
            .with(FeatureKey::Soreness, 2)
            .with(FeatureKey::ConsecutiveHighDays, 0)
            .with(FeatureKey::DaysSinceInjury, 400)
            .with(FeatureKey::InjuryFlag, false)
            .with(FeatureKey::OvertrainingRisk, false)
    }

    #[test]
    fn calm_context_allows_everything() {
        let catalog = ArmCatalog::standard();
        let out = RuleSet::standard().evaluate(&ctx(calm()), catalog.arms(), catalog.safe_default());
        assert_eq!(out.eligible.len(), catalog.len());
        assert!(out.vetoed.is_empty());
        assert!(out.forced.is_none());
    }

    #[test]
    fn injury_flag_forces_active_recovery() {
        let catalog = ArmCatalog::standard();
        let snap = calm()
            .with(FeatureKey::Readiness, 40)
            .with(FeatureKey::Hrv, 15)
            .with(FeatureKey::InjuryFlag, true);
        let out = RuleSet::standard().evaluate(&ctx(snap), catalog.arms(), catalog.safe_default());
        assert_eq!(out.forced.as_ref().map(|f| f.rule.as_str()), Some("injury_flag"));
        assert_eq!(out.eligible.len(), 1);
        assert_eq!(out.eligible[0].id.as_str(), "active_recovery");
        assert_eq!(out.vetoed.len(), catalog.len() - 1);
    }

    #[test]
    fn low_hrv_restricts_to_easy_sessions() {
        let catalog = ArmCatalog::standard();
        let snap = calm().with(FeatureKey::Hrv, 12);
        let out = RuleSet::standard().evaluate(&ctx(snap), catalog.arms(), catalog.safe_default());
        let ids: Vec<&str> = out.eligible.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["rest", "active_recovery"]);
        assert!(out.vetoed.iter().all(|v| v.rule == "low_hrv_or_sleep"));
    }

    #[test]
    fn recent_injury_vetoes_high_impact_only() {
        let catalog = ArmCatalog::standard();
        let snap = calm().with(FeatureKey::DaysSinceInjury, 5);
        let out = RuleSet::standard().evaluate(&ctx(snap), catalog.arms(), catalog.safe_default());
        let vetoed: BTreeSet<&str> = out.vetoed.iter().map(|v| v.arm.as_str()).collect();
        assert_eq!(vetoed, BTreeSet::from(["strength_high", "cardio_high"]));
    }

    #[test]
    fn every_vetoing_rule_is_reported() {
        let catalog = ArmCatalog::standard();
        let snap = calm()
            .with(FeatureKey::Readiness, 30)
            .with(FeatureKey::DaysSinceInjury, 2);
        let out = RuleSet::standard().evaluate(&ctx(snap), catalog.arms(), catalog.safe_default());
        let rules: Vec<&str> = out
            .vetoed
            .iter()
            .filter(|v| v.arm.as_str() == "cardio_high")
            .map(|v| v.rule.as_str())
            .collect();
        assert_eq!(rules, vec!["low_readiness", "recent_injury"]);
    }

    #[test]
    fn safe_default_is_subject_to_rules() {
        let catalog = ArmCatalog::standard();
        let rules = RuleSet {
            version: "strict".into(),
            rules: vec![SafetyRule {
                name: "nothing_goes".into(),
                when: Condition::AtLeast {
                    feature: FeatureKey::Readiness,
                    value: 0.0,
                },
                action: RuleAction::AllowOnly {
                    categories: vec![],
                    max: Intensity::None,
                },
                reason: "test".into(),
            }],
        };
        let out = rules.evaluate(&ctx(calm()), catalog.arms(), catalog.safe_default());
        assert!(out.eligible.is_empty());
        assert!(out.forced.is_none());
        assert_eq!(out.vetoed.len(), catalog.len());
        assert!(out.vetoed.iter().any(|v| v.arm.as_str() == "active_recovery"));
    }

    #[test]
    fn strength_only_rule_vetoes_the_safe_default() {
        let catalog = ArmCatalog::standard();
        let rules = RuleSet {
            version: "strength-only".into(),
            rules: vec![SafetyRule {
                name: "strength_block".into(),
                when: Condition::AtLeast {
                    feature: FeatureKey::Readiness,
                    value: 0.0,
                },
                action: RuleAction::AllowOnly {
                    categories: vec![Category::Strength],
                    max: Intensity::High,
                },
                reason: "strength block".into(),
            }],
        };
        let snap = calm()
            .with(FeatureKey::Readiness, 45)
            .with(FeatureKey::Fatigue, 9);
        let out = rules.evaluate(&ctx(snap), catalog.arms(), catalog.safe_default());
        let ids: Vec<&str> = out.eligible.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["strength_low", "strength_medium", "strength_high"]);
        assert!(out
            .vetoed
            .iter()
            .any(|v| v.arm.as_str() == "active_recovery" && v.rule == "strength_block"));
    }

    #[test]
    fn required_features_cover_nested_conditions() {
        let required = RuleSet::standard().required_features();
        assert!(required.contains(&FeatureKey::Hrv));
        assert!(required.contains(&FeatureKey::SleepHours));
        assert!(required.contains(&FeatureKey::InjuryFlag));
        assert!(!required.contains(&FeatureKey::DaysSinceCardio));
    }

    #[test]
    fn reload_swaps_whole_set() {
        let gate = SafetyGate::new(RuleSet::standard());
        let held = gate.rules();
        let old = gate.reload(RuleSet {
            version: "empty".into(),
            rules: vec![],
        });
        assert_eq!(old.version, "standard-1");
        assert_eq!(held.rules.len(), 9);
        assert!(gate.rules().rules.is_empty());
    }

    #[test]
    fn rule_set_roundtrips_through_json() {
        let json = serde_json::to_string(&RuleSet::standard()).expect("serialize");
        assert!(json.contains("\"op\":\"any\""));
        assert!(json.contains("\"kind\":\"force_default\""));
        let back: RuleSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, RuleSet::standard());
    }
}
