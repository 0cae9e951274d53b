//! Feedback events to posterior updates.

use crate::reward::RewardFunction;
use crate::store::{CellKey, PosteriorStore};
use crate::thompson::ThompsonSampler;
use formlern_core::{ArmId, DecisionLookup, FeedbackEvent};
use serde::Serialize;
use std::sync::Arc;

/// Result of applying one feedback event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Ack {
        decision_id: String,
        arm: ArmId,
        reward: f64,
        /// Observations of the updated cell, this event included.
        observations: u64,
    },
    /// The event id was applied before; nothing changed.
    Duplicate,
    /// The referenced decision is not visible yet; retry later.
    Deferred,
}

/// Applies feedback to the posterior store.
///
/// Safe to call from many threads: updates to one cell serialize on its
/// mutex, updates to different cells run in parallel.
pub struct OnlineUpdateEngine {
    store: Arc<PosteriorStore>,
    decisions: Arc<dyn DecisionLookup>,
    reward: RewardFunction,
    sampler: ThompsonSampler,
}

impl std::fmt::Debug for OnlineUpdateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineUpdateEngine")
            .field("store", &self.store)
            .field("reward", &self.reward)
            .finish_non_exhaustive()
    }
}

impl OnlineUpdateEngine {
    #[must_use]
    pub fn new(
        store: Arc<PosteriorStore>,
        decisions: Arc<dyn DecisionLookup>,
        reward: RewardFunction,
        sampler: ThompsonSampler,
    ) -> Self {
        Self {
            store,
            decisions,
            reward,
            sampler,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PosteriorStore> {
        &self.store
    }

    #[must_use]
    pub fn reward_function(&self) -> &RewardFunction {
        &self.reward
    }

    /// Applies `event` at most once.
    ///
    /// The decision lookup happens before the idempotency claim, so a
    /// deferred event can be delivered again and still be applied.
    pub fn apply(&self, event: &FeedbackEvent) -> ApplyOutcome {
        let Some(record) = self.decisions.find(&event.decision_id) else {
            tracing::warn!(
                event_id = %event.event_id,
                decision_id = %event.decision_id,
                "feedback for unknown decision deferred"
            );
            return ApplyOutcome::Deferred;
        };
        if !self.store.claim_event(&event.event_id) {
            tracing::debug!(event_id = %event.event_id, "duplicate feedback ignored");
            return ApplyOutcome::Duplicate;
        }
        if let (Some(tagged), Some(decided)) = (&event.cohort, &record.cohort) {
            if tagged != decided {
                tracing::warn!(
                    event_id = %event.event_id,
                    event_cohort = %tagged.name,
                    decision_cohort = %decided.name,
                    "cohort tag mismatch, using the decision's cohort"
                );
            }
        }

        let reward = self.reward.normalize(&event.outcome);
        let key = CellKey::new(record.selected.clone(), record.cluster);
        let update = self
            .store
            .update_with(&key, |current| self.sampler.update(current, reward));
        tracing::info!(
            event_id = %event.event_id,
            decision_id = %record.decision_id,
            arm = %key.arm,
            reward,
            observations = update.posterior.observations,
            reset = update.reset.is_some(),
            "feedback applied"
        );
        ApplyOutcome::Ack {
            decision_id: record.decision_id.clone(),
            arm: key.arm,
            reward,
            observations: update.posterior.observations,
        }
    }
}
