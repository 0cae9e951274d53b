#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Retrospective analysis of recommendations and their outcomes.
//!
//! Joins emitted decision records with feedback events, aggregates outcome
//! statistics per arm and per experiment cohort, and flags patterns worth a
//! look. Analysis never touches live posterior state; [`replay`] rebuilds
//! posteriors offline.

pub mod replay;

pub use replay::{parse_jsonl, ReplayError, ReplayReport, Replayer};

use formlern_bandits::RewardFunction;
use formlern_core::{ArmId, CohortPolicy, DecisionRecord, FeedbackEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

// Pattern detection thresholds
/// Minimum number of resolved outcomes for an arm before analyzing patterns
const PATTERN_MIN_OUTCOMES_PER_ARM: usize = 5;
/// Failure rate threshold (60%) above which an arm is flagged
const PATTERN_HIGH_FAILURE_THRESHOLD: f64 = 0.6;
/// Overall failure rate threshold (50%) for system-wide issues
const PATTERN_OVERALL_FAILURE_THRESHOLD: f64 = 0.5;
/// Mean reward gap between cohorts worth reporting
const PATTERN_COHORT_REWARD_GAP: f64 = 0.1;

/// Fallback timestamp when formatting fails
const FALLBACK_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// A feedback event joined with the decision it resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOutcome {
    pub decision_id: String,
    pub event_id: String,
    pub arm: ArmId,
    /// Cohort name of the decision, if it was part of an experiment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort: Option<String>,
    pub policy: CohortPolicy,
    /// The safety gate forced the arm; the outcome says nothing about scoring.
    pub forced: bool,
    pub completed: bool,
    pub injury: bool,
    /// Normalized reward in `[0, 1]`.
    pub reward: f64,
}

impl ResolvedOutcome {
    /// Completed without injury.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.completed && !self.injury
    }
}

/// Statistics aggregated from resolved outcomes.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct OutcomeStatistics {
    /// Total number of outcomes (successes + failures).
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub injuries: usize,
    pub total_reward: f64,
}

impl OutcomeStatistics {
    fn record(&mut self, outcome: &ResolvedOutcome) {
        self.total += 1;
        if outcome.is_success() {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if outcome.injury {
            self.injuries += 1;
        }
        if outcome.reward.is_finite() {
            self.total_reward += outcome.reward;
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.successes as f64 / self.total as f64
        }
    }

    /// Calculate failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        debug_assert!(
            self.successes + self.failures == self.total,
            "OutcomeStatistics totals are inconsistent"
        );
        if self.total == 0 {
            return 0.0;
        }
        1.0 - self.success_rate()
    }

    #[must_use]
    pub fn average_reward(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.total_reward / self.total as f64
        }
    }
}

/// Full analysis of a decision log and an event log.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub ts: String,
    pub decisions: usize,
    pub resolved: usize,
    /// Events whose decision is not in the log.
    pub unresolved_events: usize,
    pub forced_defaults: usize,
    pub fallbacks: usize,
    pub overall: OutcomeStatistics,
    pub by_arm: BTreeMap<String, OutcomeStatistics>,
    pub by_cohort: BTreeMap<String, OutcomeStatistics>,
    pub by_cohort_arm: BTreeMap<String, OutcomeStatistics>,
    pub patterns: Vec<String>,
}

/// Aggregates outcomes and flags patterns.
#[derive(Debug)]
pub struct OutcomeAnalyzer {
    /// Minimum number of outcomes required before reporting patterns
    min_outcomes: usize,
    reward: RewardFunction,
}

impl Default for OutcomeAnalyzer {
    fn default() -> Self {
        Self {
            min_outcomes: 10,
            reward: RewardFunction::default(),
        }
    }
}

impl OutcomeAnalyzer {
    #[must_use]
    pub fn new(min_outcomes: usize, reward: RewardFunction) -> Self {
        Self {
            min_outcomes,
            reward,
        }
    }

    /// Joins events with their decisions.
    ///
    /// Events for unknown decisions are skipped, and repeated event ids count
    /// once, matching what the online update path applies.
    #[must_use]
    pub fn resolve(&self, records: &[DecisionRecord], events: &[FeedbackEvent]) -> Vec<ResolvedOutcome> {
        let by_id: HashMap<&str, &DecisionRecord> =
            records.iter().map(|r| (r.decision_id.as_str(), r)).collect();
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for event in events {
            let Some(record) = by_id.get(event.decision_id.as_str()) else {
                continue;
            };
            if !seen.insert(event.event_id.as_str()) {
                continue;
            }
            resolved.push(ResolvedOutcome {
                decision_id: record.decision_id.clone(),
                event_id: event.event_id.clone(),
                arm: record.selected.clone(),
                cohort: record.cohort.as_ref().map(|c| c.name.clone()),
                policy: record
                    .cohort
                    .as_ref()
                    .map_or(CohortPolicy::Hybrid, |c| c.policy),
                forced: record.forced_default.is_some() || record.fallback.is_some(),
                completed: event.outcome.completed,
                injury: event.outcome.injury,
                reward: self.reward.normalize(&event.outcome),
            });
        }
        resolved
    }

    /// Aggregate outcomes by a grouping key (e.g., arm, cohort).
    #[must_use]
    pub fn aggregate_outcomes(
        &self,
        outcomes: &[ResolvedOutcome],
        key_fn: impl Fn(&ResolvedOutcome) -> Option<String>,
    ) -> BTreeMap<String, OutcomeStatistics> {
        let mut stats: BTreeMap<String, OutcomeStatistics> = BTreeMap::new();
        for outcome in outcomes {
            if let Some(key) = key_fn(outcome) {
                stats.entry(key).or_default().record(outcome);
            }
        }
        stats
    }

    #[must_use]
    pub fn by_arm(&self, outcomes: &[ResolvedOutcome]) -> BTreeMap<String, OutcomeStatistics> {
        self.aggregate_outcomes(outcomes, |o| Some(o.arm.to_string()))
    }

    #[must_use]
    pub fn by_cohort(&self, outcomes: &[ResolvedOutcome]) -> BTreeMap<String, OutcomeStatistics> {
        self.aggregate_outcomes(outcomes, |o| o.cohort.clone())
    }

    /// Keys are `cohort/arm`.
    #[must_use]
    pub fn by_cohort_arm(&self, outcomes: &[ResolvedOutcome]) -> BTreeMap<String, OutcomeStatistics> {
        self.aggregate_outcomes(outcomes, |o| {
            o.cohort.as_ref().map(|c| format!("{c}/{}", o.arm))
        })
    }

    fn summarize(outcomes: &[ResolvedOutcome]) -> OutcomeStatistics {
        let mut stats = OutcomeStatistics::default();
        for outcome in outcomes {
            stats.record(outcome);
        }
        stats
    }

    /// Heuristic pattern detection over resolved outcomes.
    #[must_use]
    pub fn analyze_patterns(&self, outcomes: &[ResolvedOutcome]) -> Vec<String> {
        let mut patterns = Vec::new();
        if outcomes.len() < self.min_outcomes {
            return patterns;
        }

        // Forced defaults say nothing about arm quality.
        let scored: Vec<ResolvedOutcome> = outcomes.iter().filter(|o| !o.forced).cloned().collect();
        for (arm, stats) in &self.by_arm(&scored) {
            if stats.total >= PATTERN_MIN_OUTCOMES_PER_ARM
                && stats.failure_rate() > PATTERN_HIGH_FAILURE_THRESHOLD
            {
                patterns.push(format!(
                    "High failure rate ({:.1}%) for arm '{}'",
                    stats.failure_rate() * 100.0,
                    arm
                ));
            }
            if stats.injuries > 0 {
                patterns.push(format!(
                    "{} injury report(s) after arm '{}'",
                    stats.injuries, arm
                ));
            }
        }

        let overall = Self::summarize(outcomes);
        if overall.failure_rate() > PATTERN_OVERALL_FAILURE_THRESHOLD {
            patterns.push(format!(
                "Overall failure rate is high ({:.1}%)",
                overall.failure_rate() * 100.0
            ));
        }

        let by_cohort = self.by_cohort(outcomes);
        let means: Vec<(&String, f64)> = by_cohort
            .iter()
            .filter(|(_, s)| s.total >= PATTERN_MIN_OUTCOMES_PER_ARM)
            .map(|(c, s)| (c, s.average_reward()))
            .collect();
        if let (Some(best), Some(worst)) = (
            means.iter().max_by(|a, b| a.1.total_cmp(&b.1)),
            means.iter().min_by(|a, b| a.1.total_cmp(&b.1)),
        ) {
            if best.1 - worst.1 > PATTERN_COHORT_REWARD_GAP {
                patterns.push(format!(
                    "Cohort '{}' leads cohort '{}' by {:.2} mean reward",
                    best.0,
                    worst.0,
                    best.1 - worst.1
                ));
            }
        }

        patterns
    }

    /// Resolves, aggregates and analyzes in one pass.
    #[must_use]
    pub fn report(&self, records: &[DecisionRecord], events: &[FeedbackEvent]) -> AnalysisReport {
        let outcomes = self.resolve(records, events);
        let known: HashSet<&str> = records.iter().map(|r| r.decision_id.as_str()).collect();
        AnalysisReport {
            ts: iso8601_now(),
            decisions: records.len(),
            resolved: outcomes.len(),
            unresolved_events: events
                .iter()
                .filter(|e| !known.contains(e.decision_id.as_str()))
                .count(),
            forced_defaults: records.iter().filter(|r| r.forced_default.is_some()).count(),
            fallbacks: records.iter().filter(|r| r.fallback.is_some()).count(),
            overall: Self::summarize(&outcomes),
            by_arm: self.by_arm(&outcomes),
            by_cohort: self.by_cohort(&outcomes),
            by_cohort_arm: self.by_cohort_arm(&outcomes),
            patterns: self.analyze_patterns(&outcomes),
        }
    }
}

fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| FALLBACK_TIMESTAMP.to_string())
}
