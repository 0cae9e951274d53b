//! Core types and collaborator traits for the formlern decision engine.

pub mod arm;
pub mod cohort;
pub mod context;
pub mod event;
pub mod record;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use arm::{Arm, ArmCatalog, ArmId, CatalogError, CatalogSpec, Category, DurationRange, Intensity};
pub use cohort::{Cohort, CohortPolicy};
pub use context::{
    Context, ContextError, ContextSchema, FeatureKey, FeatureKind, FeatureSnapshot, FeatureValue,
    Goal, Reading,
};
pub use event::{FeedbackEvent, Outcome};
pub use record::{
    ArmScore, ClusterId, DecisionRecord, DecisionStage, Fallback, FaultNote, ForcedDefault, Veto,
};

/// Error type returned by collaborator implementations.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Deterministic per-arm scoring.
pub trait ArmScorer: Send + Sync {
    /// Score in `[0, 1]`; identical inputs always yield identical scores.
    fn score(&self, ctx: &Context, arm: &Arm) -> f64;
    /// Features read by [`ArmScorer::score`]; they become mandatory context.
    fn required_features(&self) -> BTreeSet<FeatureKey>;
}

/// Append-only destination for emitted decision records.
pub trait DecisionSink: Send + Sync {
    /// # Errors
    /// Implementation-defined persistence failure.
    fn emit(&self, record: &Arc<DecisionRecord>) -> Result<(), SinkError>;
}

/// Read access to previously emitted decision records.
pub trait DecisionLookup: Send + Sync {
    /// `None` while the record is not (yet) visible.
    fn find(&self, decision_id: &str) -> Option<Arc<DecisionRecord>>;
}
