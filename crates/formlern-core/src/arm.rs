//! Arms (plan templates) and the versioned arm catalog.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Arm identifier. Arms are never mutated once published, a changed template
/// gets a new id so historical rewards stay attributable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArmId(String);

impl ArmId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for ArmId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Rest,
    Recovery,
    Strength,
    Cardio,
}

/// Intensity tier, ordered from least to most demanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    None,
    Low,
    Medium,
    High,
}

impl Intensity {
    /// Numeric level 0..=3.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Intensity::None => 0,
            Intensity::Low => 1,
            Intensity::Medium => 2,
            Intensity::High => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationRange {
    pub min_minutes: u16,
    pub max_minutes: u16,
}

/// A selectable training-plan template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arm {
    pub id: ArmId,
    pub category: Category,
    pub intensity: Intensity,
    pub duration: DurationRange,
    /// Tags matched by contraindication safety rules (e.g. `high_impact`).
    #[serde(default)]
    pub contraindications: BTreeSet<String>,
    #[serde(default)]
    pub description: String,
}

impl Arm {
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.contraindications.contains(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("arm '{0}' is already published")]
    DuplicateArm(ArmId),
    #[error("safe default arm '{0}' is not in the catalog")]
    UnknownSafeDefault(ArmId),
    #[error("arm '{0}' has an empty or inverted duration range")]
    InvalidDuration(ArmId),
    #[error("catalog has no arms")]
    Empty,
}

/// Serializable catalog definition, part of the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSpec {
    pub version: String,
    pub safe_default: ArmId,
    /// Arms in priority order; earlier arms win score ties.
    pub arms: Vec<Arm>,
}

impl Default for CatalogSpec {
    fn default() -> Self {
        ArmCatalog::standard().to_spec()
    }
}

/// Immutable registry of arms with a fixed priority order.
#[derive(Debug, Clone)]
pub struct ArmCatalog {
    version: String,
    arms: Vec<Arc<Arm>>,
    index: HashMap<ArmId, usize>,
    safe_default: usize,
}

impl ArmCatalog {
    /// Builds a catalog from its definition.
    ///
    /// # Errors
    /// Duplicate ids, invalid duration ranges, an empty arm list or a safe
    /// default that is not part of the catalog.
    pub fn from_spec(spec: CatalogSpec) -> Result<Self, CatalogError> {
        if spec.arms.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut arms = Vec::with_capacity(spec.arms.len());
        let mut index = HashMap::with_capacity(spec.arms.len());
        for arm in spec.arms {
            if arm.duration.min_minutes > arm.duration.max_minutes {
                return Err(CatalogError::InvalidDuration(arm.id));
            }
            if index.contains_key(&arm.id) {
                return Err(CatalogError::DuplicateArm(arm.id));
            }
            index.insert(arm.id.clone(), arms.len());
            arms.push(Arc::new(arm));
        }
        let safe_default = *index
            .get(&spec.safe_default)
            .ok_or(CatalogError::UnknownSafeDefault(spec.safe_default))?;
        Ok(Self {
            version: spec.version,
            arms,
            index,
            safe_default,
        })
    }

    /// Publishes a new arm at the lowest priority.
    ///
    /// # Errors
    /// [`CatalogError::DuplicateArm`] if the id exists, published arms are
    /// never replaced in place.
    pub fn publish(&mut self, arm: Arm) -> Result<(), CatalogError> {
        if self.index.contains_key(&arm.id) {
            return Err(CatalogError::DuplicateArm(arm.id));
        }
        if arm.duration.min_minutes > arm.duration.max_minutes {
            return Err(CatalogError::InvalidDuration(arm.id));
        }
        self.index.insert(arm.id.clone(), self.arms.len());
        self.arms.push(Arc::new(arm));
        Ok(())
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Arms in priority order.
    #[must_use]
    pub fn arms(&self) -> &[Arc<Arm>] {
        &self.arms
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Arm>> {
        self.index.get(id).map(|&i| &self.arms[i])
    }

    /// Position in the tie-break order; lower wins.
    #[must_use]
    pub fn priority(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    #[must_use]
    pub fn safe_default(&self) -> &Arc<Arm> {
        &self.arms[self.safe_default]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    #[must_use]
    pub fn to_spec(&self) -> CatalogSpec {
        CatalogSpec {
            version: self.version.clone(),
            safe_default: self.safe_default().id.clone(),
            arms: self.arms.iter().map(|a| Arm::clone(a)).collect(),
        }
    }

    /// The default catalog: rest, active recovery and three intensity tiers of
    /// strength and cardio work. Lower-risk arms come first so they win ties.
    #[must_use]
    pub fn standard() -> Self {
        fn arm(
            id: &str,
            category: Category,
            intensity: Intensity,
            (min_minutes, max_minutes): (u16, u16),
            tags: &[&str],
            description: &str,
        ) -> Arm {
            Arm {
                id: ArmId::from(id),
                category,
                intensity,
                duration: DurationRange {
                    min_minutes,
                    max_minutes,
                },
                contraindications: tags.iter().map(|t| (*t).to_string()).collect(),
                description: description.to_string(),
            }
        }

        let arms = vec![
            arm("rest", Category::Rest, Intensity::None, (0, 0), &[], "Rest day, no training"),
            arm(
                "active_recovery",
                Category::Recovery,
                Intensity::Low,
                (20, 30),
                &[],
                "Easy mobility and walking",
            ),
            arm(
                "strength_low",
                Category::Strength,
                Intensity::Low,
                (30, 45),
                &["load_bearing"],
                "Technique-focused strength session",
            ),
            arm(
                "cardio_low",
                Category::Cardio,
                Intensity::Low,
                (20, 45),
                &[],
                "Zone 2 aerobic session",
            ),
            arm(
                "strength_medium",
                Category::Strength,
                Intensity::Medium,
                (30, 45),
                &["load_bearing"],
                "Moderate strength session",
            ),
            arm(
                "cardio_medium",
                Category::Cardio,
                Intensity::Medium,
                (20, 45),
                &[],
                "Tempo cardio session",
            ),
            arm(
                "strength_high",
                Category::Strength,
                Intensity::High,
                (30, 45),
                &["load_bearing", "high_impact"],
                "Heavy strength session",
            ),
            arm(
                "cardio_high",
                Category::Cardio,
                Intensity::High,
                (20, 45),
                &["high_impact"],
                "Interval session",
            ),
        ];

        let index = arms
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        Self {
            version: "standard-1".to_string(),
            arms: arms.into_iter().map(Arc::new).collect(),
            index,
            safe_default: 1,
        }
    }
}
