//! Typed decision context.
//!
//! The feature store delivers a loosely typed [`FeatureSnapshot`]. It is
//! validated exactly once, at the boundary, by a [`ContextSchema`] into an
//! immutable [`Context`]. Downstream components only ever see the typed form:
//! every reading is either observed or explicitly marked as substituted from a
//! configured default.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Known context features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    /// Wearable readiness score, 0-100.
    Readiness,
    /// Heart rate variability in ms.
    Hrv,
    /// Sleep quality score, 0-100.
    SleepScore,
    SleepHours,
    /// Resting heart rate in bpm.
    RestingHr,
    /// Self-reported fatigue, 1-10.
    Fatigue,
    /// Self-reported muscle soreness, 1-10.
    Soreness,
    DaysSinceInjury,
    DaysSinceTraining,
    DaysSinceStrength,
    DaysSinceCardio,
    /// Progress towards the current goal, 0-1.
    GoalProgress,
    ConsecutiveHighDays,
    InjuryFlag,
    OvertrainingRisk,
}

/// Value kind expected for a [`FeatureKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Number,
    Flag,
}

impl FeatureKey {
    pub const ALL: [FeatureKey; 15] = [
        FeatureKey::Readiness,
        FeatureKey::Hrv,
        FeatureKey::SleepScore,
        FeatureKey::SleepHours,
        FeatureKey::RestingHr,
        FeatureKey::Fatigue,
        FeatureKey::Soreness,
        FeatureKey::DaysSinceInjury,
        FeatureKey::DaysSinceTraining,
        FeatureKey::DaysSinceStrength,
        FeatureKey::DaysSinceCardio,
        FeatureKey::GoalProgress,
        FeatureKey::ConsecutiveHighDays,
        FeatureKey::InjuryFlag,
        FeatureKey::OvertrainingRisk,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKey::Readiness => "readiness",
            FeatureKey::Hrv => "hrv",
            FeatureKey::SleepScore => "sleep_score",
            FeatureKey::SleepHours => "sleep_hours",
            FeatureKey::RestingHr => "resting_hr",
            FeatureKey::Fatigue => "fatigue",
            FeatureKey::Soreness => "soreness",
            FeatureKey::DaysSinceInjury => "days_since_injury",
            FeatureKey::DaysSinceTraining => "days_since_training",
            FeatureKey::DaysSinceStrength => "days_since_strength",
            FeatureKey::DaysSinceCardio => "days_since_cardio",
            FeatureKey::GoalProgress => "goal_progress",
            FeatureKey::ConsecutiveHighDays => "consecutive_high_days",
            FeatureKey::InjuryFlag => "injury_flag",
            FeatureKey::OvertrainingRisk => "overtraining_risk",
        }
    }

    /// Looks up a feature by its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    #[must_use]
    pub fn kind(self) -> FeatureKind {
        match self {
            FeatureKey::InjuryFlag | FeatureKey::OvertrainingRisk => FeatureKind::Flag,
            _ => FeatureKind::Number,
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed feature value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Number(f64),
}

impl FeatureValue {
    #[must_use]
    pub fn kind(self) -> FeatureKind {
        match self {
            FeatureValue::Flag(_) => FeatureKind::Flag,
            FeatureValue::Number(_) => FeatureKind::Number,
        }
    }
}

/// One feature reading inside a validated [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: FeatureValue,
    /// `true` if the feature was absent and the configured default was used.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub defaulted: bool,
}

/// Training goal declared in the user profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Strength,
    Endurance,
    FatLoss,
    General,
}

/// Raw feature-store payload for one `(user, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FeatureSnapshot {
    pub user_id: String,
    /// ISO-8601 timestamp the features were materialized for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    /// Feature-store schema version.
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<Goal>,
    #[serde(default)]
    pub features: BTreeMap<String, Value>,
}

impl FeatureSnapshot {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with(mut self, key: FeatureKey, value: impl Into<Value>) -> Self {
        self.features.insert(key.as_str().to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goal = Some(goal);
        self
    }
}

/// Immutable, validated decision context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<Goal>,
    readings: BTreeMap<FeatureKey, Reading>,
}

impl Context {
    #[must_use]
    pub fn reading(&self, key: FeatureKey) -> Option<&Reading> {
        self.readings.get(&key)
    }

    /// Numeric value of `key`, observed or defaulted.
    #[must_use]
    pub fn number(&self, key: FeatureKey) -> Option<f64> {
        match self.readings.get(&key)?.value {
            FeatureValue::Number(v) => Some(v),
            FeatureValue::Flag(_) => None,
        }
    }

    #[must_use]
    pub fn flag(&self, key: FeatureKey) -> Option<bool> {
        match self.readings.get(&key)?.value {
            FeatureValue::Flag(v) => Some(v),
            FeatureValue::Number(_) => None,
        }
    }

    #[must_use]
    pub fn readings(&self) -> &BTreeMap<FeatureKey, Reading> {
        &self.readings
    }

    /// Features that were substituted from configured defaults.
    pub fn defaulted(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.readings
            .iter()
            .filter(|(_, r)| r.defaulted)
            .map(|(k, _)| *k)
    }
}

/// Why a snapshot could not become a [`Context`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("context incomplete, missing features: {}", join_keys(.missing))]
    Incomplete { missing: Vec<FeatureKey> },
    #[error("invalid feature '{key}': {reason}")]
    InvalidFeature { key: FeatureKey, reason: String },
}

fn join_keys(keys: &[FeatureKey]) -> String {
    keys.iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Mandatory features and their documented defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSchema {
    required: BTreeSet<FeatureKey>,
    defaults: BTreeMap<FeatureKey, FeatureValue>,
}

impl ContextSchema {
    #[must_use]
    pub fn new(
        required: impl IntoIterator<Item = FeatureKey>,
        defaults: BTreeMap<FeatureKey, FeatureValue>,
    ) -> Self {
        Self {
            required: required.into_iter().collect(),
            defaults,
        }
    }

    #[must_use]
    pub fn required(&self) -> &BTreeSet<FeatureKey> {
        &self.required
    }

    #[must_use]
    pub fn defaults(&self) -> &BTreeMap<FeatureKey, FeatureValue> {
        &self.defaults
    }

    /// Validates a raw snapshot.
    ///
    /// Unknown feature names are ignored and JSON `null` counts as absent.
    /// Absent features take their configured default (marked `defaulted`);
    /// a required feature without default fails with
    /// [`ContextError::Incomplete`] listing every missing key.
    ///
    /// # Errors
    /// [`ContextError::InvalidFeature`] for values of the wrong kind, non-finite
    /// or negative numbers; [`ContextError::Incomplete`] as described above.
    pub fn validate(&self, snapshot: &FeatureSnapshot) -> Result<Context, ContextError> {
        let mut readings = BTreeMap::new();

        for (name, raw) in &snapshot.features {
            let Some(key) = FeatureKey::from_name(name) else {
                continue;
            };
            if raw.is_null() {
                continue;
            }
            let value = parse_value(key, raw)?;
            readings.insert(
                key,
                Reading {
                    value,
                    defaulted: false,
                },
            );
        }

        for (key, value) in &self.defaults {
            if !readings.contains_key(key) {
                readings.insert(
                    *key,
                    Reading {
                        value: *value,
                        defaulted: true,
                    },
                );
            }
        }

        let missing: Vec<FeatureKey> = self
            .required
            .iter()
            .filter(|k| !readings.contains_key(k))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ContextError::Incomplete { missing });
        }

        Ok(Context {
            user_id: snapshot.user_id.clone(),
            ts: snapshot.ts.clone(),
            version: snapshot.version,
            goal: snapshot.goal,
            readings,
        })
    }
}

fn parse_value(key: FeatureKey, raw: &Value) -> Result<FeatureValue, ContextError> {
    match key.kind() {
        FeatureKind::Flag => raw
            .as_bool()
            .map(FeatureValue::Flag)
            .ok_or_else(|| ContextError::InvalidFeature {
                key,
                reason: format!("expected boolean, got {raw}"),
            }),
        FeatureKind::Number => {
            let v = raw.as_f64().ok_or_else(|| ContextError::InvalidFeature {
                key,
                reason: format!("expected number, got {raw}"),
            })?;
            if !v.is_finite() || v < 0.0 {
                return Err(ContextError::InvalidFeature {
                    key,
                    reason: format!("value {v} out of range"),
                });
            }
            Ok(FeatureValue::Number(v))
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ContextSchema {
        let mut defaults = BTreeMap::new();
        defaults.insert(FeatureKey::InjuryFlag, FeatureValue::Flag(false));
        ContextSchema::new(
            [FeatureKey::Readiness, FeatureKey::Hrv, FeatureKey::InjuryFlag],
            defaults,
        )
    }

    #[test]
    fn missing_required_feature_is_reported_by_name() {
        let snap = FeatureSnapshot::new("u1").with(FeatureKey::Readiness, 70);
        let err = schema().validate(&snap).expect_err("hrv is missing");
        assert_eq!(
            err,
            ContextError::Incomplete {
                missing: vec![FeatureKey::Hrv]
            }
        );
        assert!(err.to_string().contains("hrv"));
    }

    #[test]
    fn defaults_are_flagged_not_silent() {
        let snap = FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, 70)
            .with(FeatureKey::Hrv, 55.5);
        let ctx = schema().validate(&snap).expect("valid");
        assert_eq!(ctx.flag(FeatureKey::InjuryFlag), Some(false));
        assert_eq!(ctx.defaulted().collect::<Vec<_>>(), vec![FeatureKey::InjuryFlag]);
        assert!(!ctx.reading(FeatureKey::Hrv).expect("hrv").defaulted);
    }

    #[test]
    fn null_counts_as_absent() {
        let snap = FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, 70)
            .with(FeatureKey::Hrv, Value::Null);
        assert!(matches!(
            schema().validate(&snap),
            Err(ContextError::Incomplete { .. })
        ));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let snap = FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, 70)
            .with(FeatureKey::Hrv, 40)
            .with(FeatureKey::InjuryFlag, 1);
        let err = schema().validate(&snap).expect_err("flag must be boolean");
        assert!(matches!(
            err,
            ContextError::InvalidFeature {
                key: FeatureKey::InjuryFlag,
                ..
            }
        ));
    }

    #[test]
    fn negative_numbers_are_rejected() {
        let snap = FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, -3)
            .with(FeatureKey::Hrv, 40);
        assert!(schema().validate(&snap).is_err());
    }

    #[test]
    fn snapshot_from_json_ignores_unknown_features() {
        let snap: FeatureSnapshot = serde_json::from_value(json!({
            "user_id": "u7",
            "ts": "2026-03-01T07:00:00Z",
            "goal": "endurance",
            "features": {"readiness": 81, "hrv": 62, "steps": 12000}
        }))
        .expect("deserialize");
        let ctx = schema().validate(&snap).expect("valid");
        assert_eq!(ctx.goal, Some(Goal::Endurance));
        assert_eq!(ctx.number(FeatureKey::Readiness), Some(81.0));
        assert_eq!(ctx.readings().len(), 3);
    }

    #[test]
    fn context_serializes_feature_keys_by_name() {
        let snap = FeatureSnapshot::new("u1")
            .with(FeatureKey::Readiness, 70)
            .with(FeatureKey::Hrv, 50);
        let ctx = schema().validate(&snap).expect("valid");
        let json = serde_json::to_string(&ctx).expect("serialize");
        assert!(json.contains("\"readiness\""));
        assert!(json.contains("\"injury_flag\""));
        let back: Context = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ctx);
    }
}
