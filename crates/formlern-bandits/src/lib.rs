#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Safety-gated hybrid decision engine.
//!
//! A request flows through the [`SafetyGate`], the rule-based
//! [`HeuristicScorer`] and Thompson sampling over the [`PosteriorStore`],
//! is mixed by the [`HybridBlender`] and emitted as a decision record.
//! Feedback flows back through the [`OnlineUpdateEngine`], which is the only
//! writer of posterior state.

pub mod allocator;
pub mod blend;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod heuristic;
pub mod log;
pub mod posterior;
pub mod reward;
pub mod safety;
pub mod store;
pub mod thompson;
pub mod update;

pub use allocator::{CohortSpec, ExperimentAllocator, ExperimentConfig};
pub use blend::{BlendConfig, BlendCurve, HybridBlender};
pub use config::{ConfigError, EngineConfig, SamplingMode};
pub use engine::{DecisionEngine, DecisionRequest};
pub use error::{EngineError, Result};
pub use heuristic::{HeuristicScorer, HeuristicWeights};
pub use log::MemoryDecisionLog;
pub use posterior::{
    ArmPrior, Belief, Posterior, PosteriorFault, PriorConfig, RewardModel, ORDER_TOLERANCE,
};
pub use reward::{RewardFunction, RewardWeights};
pub use safety::{Condition, GateOutcome, RuleAction, RuleSet, SafetyGate, SafetyRule};
pub use store::{CellKey, PosteriorSnapshot, PosteriorStore, StoreSnapshot};
pub use thompson::{Clustering, ThompsonSampler};
pub use update::{ApplyOutcome, OnlineUpdateEngine};

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Fallback timestamp when formatting fails
const FALLBACK_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// Current UTC time as RFC 3339.
#[must_use]
pub fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| FALLBACK_TIMESTAMP.to_string())
}

/// Builds the engine pair sharing one store and one decision log.
///
/// # Errors
/// [`EngineError::Config`] if the configuration does not validate.
pub fn build(
    config: &EngineConfig,
    store: std::sync::Arc<PosteriorStore>,
    log: std::sync::Arc<MemoryDecisionLog>,
) -> Result<(DecisionEngine, OnlineUpdateEngine)> {
    let engine = DecisionEngine::new(config, store.clone(), log.clone())?;
    let updates = OnlineUpdateEngine::new(
        store,
        log,
        RewardFunction::new(config.reward.clone()),
        ThompsonSampler::new(config.clustering.clone()),
    );
    Ok((engine, updates))
}
