//! Per-request orchestration: gate, score, blend, select, emit.

use crate::allocator::ExperimentAllocator;
use crate::blend::HybridBlender;
use crate::config::{EngineConfig, SamplingMode};
use crate::error::{EngineError, Result};
use crate::hash::stable_hash64;
use crate::heuristic::HeuristicScorer;
use crate::iso8601_now;
use crate::safety::{RuleSet, SafetyGate};
use crate::store::{CellKey, PosteriorStore};
use crate::thompson::ThompsonSampler;
use formlern_core::{
    Arm, ArmCatalog, ArmId, ArmScore, ArmScorer, Cohort, CohortPolicy, ContextSchema,
    DecisionRecord, DecisionSink, DecisionStage, Fallback, FeatureKey, FeatureSnapshot,
    FeatureValue,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One recommendation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Becomes the decision id; feedback events reference it.
    pub request_id: String,
    pub user_key: String,
    pub snapshot: FeatureSnapshot,
    /// Bypasses the allocator, e.g. for QA accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort_override: Option<Cohort>,
    /// Restricts the decision to these arms; the whole catalog otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<ArmId>>,
}

impl DecisionRequest {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        user_key: impl Into<String>,
        snapshot: FeatureSnapshot,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_key: user_key.into(),
            snapshot,
            cohort_override: None,
            candidates: None,
        }
    }

    #[must_use]
    pub fn with_candidates(mut self, ids: impl IntoIterator<Item = ArmId>) -> Self {
        self.candidates = Some(ids.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_cohort(mut self, cohort: Cohort) -> Self {
        self.cohort_override = Some(cohort);
        self
    }
}

/// Hybrid decision engine.
///
/// Decisions only read shared state: the rule set through one `Arc` load and
/// the posterior store through a lock-free snapshot. The only side effect is
/// the final emission to the sink.
pub struct DecisionEngine {
    config_version: String,
    catalog: ArmCatalog,
    gate: SafetyGate,
    scorer: Arc<dyn ArmScorer>,
    sampler: ThompsonSampler,
    blender: HybridBlender,
    allocator: ExperimentAllocator,
    active_experiment: Option<String>,
    context_defaults: BTreeMap<FeatureKey, FeatureValue>,
    sampling: SamplingMode,
    latency_budget: Duration,
    store: Arc<PosteriorStore>,
    sink: Arc<dyn DecisionSink>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config_version", &self.config_version)
            .field("catalog_version", &self.catalog.version())
            .field("rules_version", &self.gate.rules().version)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// # Errors
    /// [`EngineError::Config`] if the configuration does not validate.
    pub fn new(
        config: &EngineConfig,
        store: Arc<PosteriorStore>,
        sink: Arc<dyn DecisionSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config_version: config.version.clone(),
            catalog: config.build_catalog()?,
            gate: SafetyGate::new(config.rules.clone()),
            scorer: Arc::new(HeuristicScorer::new(config.scorer.clone())),
            sampler: ThompsonSampler::new(config.clustering.clone()),
            blender: HybridBlender::new(config.blend),
            allocator: ExperimentAllocator::new(config.experiments.clone()),
            active_experiment: config.active_experiment.clone(),
            context_defaults: config.context_defaults.clone(),
            sampling: config.sampling,
            latency_budget: Duration::from_millis(config.latency_budget_ms),
            store,
            sink,
        })
    }

    /// Replaces the rule-based scorer.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn ArmScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &ArmCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PosteriorStore> {
        &self.store
    }

    #[must_use]
    pub fn sampler(&self) -> &ThompsonSampler {
        &self.sampler
    }

    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        self.gate.rules()
    }

    /// Atomically swaps the safety rules; in-flight decisions finish on the
    /// set they started with.
    pub fn reload_rules(&self, rules: RuleSet) -> Arc<RuleSet> {
        self.gate.reload(rules)
    }

    /// Context schema for the given rule set: every feature the rules, the
    /// scorer or the clustering read is mandatory.
    #[must_use]
    pub fn schema_for(&self, rules: &RuleSet) -> ContextSchema {
        let mut required = rules.required_features();
        required.extend(self.scorer.required_features());
        required.extend(self.sampler.required_features());
        ContextSchema::new(required, self.context_defaults.clone())
    }

    /// Cohort for a request: the override if present, else the allocator's
    /// assignment in the active experiment.
    #[must_use]
    pub fn cohort_for(&self, request: &DecisionRequest) -> Option<Cohort> {
        request.cohort_override.clone().or_else(|| {
            self.active_experiment
                .as_deref()
                .and_then(|exp| self.allocator.assign(&request.user_key, exp))
        })
    }

    /// Decides with a seed chosen by the configured [`SamplingMode`].
    ///
    /// # Errors
    /// See [`DecisionEngine::decide_seeded`].
    pub fn decide(&self, request: &DecisionRequest) -> Result<Arc<DecisionRecord>> {
        let seed = match self.sampling {
            SamplingMode::Randomized => rand::random::<u64>(),
            SamplingMode::PerRequestSeeded => stable_hash64(0, &request.request_id),
        };
        self.decide_seeded(request, seed)
    }

    /// Decides with an explicit sampling seed. Identical request, seed and
    /// store state give an identical record apart from timing fields.
    ///
    /// # Errors
    /// [`EngineError::Context`] for an invalid or incomplete snapshot,
    /// [`EngineError::UnknownArm`] for an unknown candidate id,
    /// [`EngineError::Sink`] if the record could not be emitted. No record is
    /// emitted on error.
    pub fn decide_seeded(&self, request: &DecisionRequest, seed: u64) -> Result<Arc<DecisionRecord>> {
        let started = Instant::now();
        let mut stages = vec![DecisionStage::Received];
        tracing::debug!(request_id = %request.request_id, stage = "received");

        let rules = self.gate.rules();
        let context = self.schema_for(&rules).validate(&request.snapshot)?;
        for key in context.defaulted() {
            tracing::debug!(request_id = %request.request_id, feature = %key, "feature defaulted");
        }
        let candidates = self.resolve_candidates(request.candidates.as_deref())?;
        let safe_default = self.catalog.safe_default();

        let gate = rules.evaluate(&context, &candidates, safe_default);
        stages.push(DecisionStage::SafetyFiltered);
        tracing::debug!(
            request_id = %request.request_id,
            stage = "safety_filtered",
            eligible = gate.eligible.len(),
            vetoed = gate.vetoed.len()
        );

        let cohort = self.cohort_for(request);
        let policy = cohort.as_ref().map_or(CohortPolicy::Hybrid, |c| c.policy);
        let cluster = self.sampler.cluster_of(&context);

        let mut scores = Vec::new();
        let mut fallback = None;
        let mut faults = Vec::new();
        let mut snapshot_version = self.store.version();

        let selected = if gate.forced.is_some() {
            safe_default.id.clone()
        } else if gate.eligible.is_empty() {
            tracing::error!(
                request_id = %request.request_id,
                safe_default = %safe_default.id,
                candidates = candidates.len(),
                "all arms vetoed, falling back to safe default"
            );
            fallback = Some(Fallback::AllArmsVetoed);
            stages.push(DecisionStage::Selected);
            safe_default.id.clone()
        } else {
            let keys: Vec<CellKey> = gate
                .eligible
                .iter()
                .map(|arm| CellKey::new(arm.id.clone(), cluster))
                .collect();
            let snapshot = self.store.snapshot(&keys);
            snapshot_version = snapshot.version();
            faults.extend_from_slice(snapshot.faults());

            let mut rng = StdRng::seed_from_u64(seed);
            let raw: Vec<(&Arc<Arm>, f64, Option<f64>, u64)> = gate
                .eligible
                .iter()
                .zip(&keys)
                .map(|(arm, key)| {
                    let rule = clamp_unit(self.scorer.score(&context, arm));
                    let observations = snapshot.get(key).map_or(0, |p| p.observations);
                    let sample = (policy == CohortPolicy::Hybrid
                        && self.blender.bandit_weight(observations) > 0.0)
                        .then(|| self.sampler.score(&context, arm, &snapshot, &mut rng));
                    (arm, rule, sample, observations)
                })
                .collect();
            stages.push(DecisionStage::Scored);

            scores = raw
                .into_iter()
                .map(|(arm, rule, bandit, observations)| {
                    let (final_score, bandit_weight) = self.blender.blend(rule, bandit, observations);
                    ArmScore {
                        arm: arm.id.clone(),
                        rule,
                        bandit,
                        bandit_weight,
                        final_score,
                        observations,
                    }
                })
                .collect();
            self.blender.rank(&mut scores, &self.catalog);
            stages.push(DecisionStage::Blended);

            let best = scores.first().map_or_else(|| safe_default.id.clone(), |s| s.arm.clone());
            stages.push(DecisionStage::Selected);
            best
        };
        stages.push(DecisionStage::Emitted);

        let elapsed = started.elapsed();
        let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        if elapsed > self.latency_budget {
            tracing::warn!(
                request_id = %request.request_id,
                elapsed_us,
                budget = ?self.latency_budget,
                "decision exceeded latency budget"
            );
        }

        let record = Arc::new(DecisionRecord {
            decision_id: request.request_id.clone(),
            ts: iso8601_now(),
            user_key: request.user_key.clone(),
            context,
            selected,
            scores,
            vetoes: gate.vetoed,
            forced_default: gate.forced,
            fallback,
            cohort,
            cluster,
            catalog_version: self.catalog.version().to_string(),
            config_version: self.config_version.clone(),
            seed,
            snapshot_version,
            stages,
            elapsed_us,
            faults,
        });
        debug_assert!(
            record.fallback.is_some() || !record.is_vetoed(&record.selected),
            "vetoed arm selected"
        );

        self.sink.emit(&record).map_err(EngineError::Sink)?;
        tracing::info!(
            decision_id = %record.decision_id,
            selected = %record.selected,
            forced = record.forced_default.is_some(),
            cohort = record.cohort.as_ref().map(|c| c.name.as_str()),
            elapsed_us = record.elapsed_us,
            "decision emitted"
        );
        Ok(record)
    }

    fn resolve_candidates(&self, ids: Option<&[ArmId]>) -> Result<Vec<Arc<Arm>>> {
        let Some(ids) = ids else {
            return Ok(self.catalog.arms().to_vec());
        };
        let mut out: Vec<Arc<Arm>> = Vec::with_capacity(ids.len());
        for id in ids {
            let arm = self
                .catalog
                .get(id.as_str())
                .ok_or_else(|| EngineError::UnknownArm(id.clone()))?;
            if !out.iter().any(|a| a.id == arm.id) {
                out.push(Arc::clone(arm));
            }
        }
        Ok(out)
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
