//! Offline rebuild of posterior state from decision and event logs.
//!
//! Uses the same [`OnlineUpdateEngine`] as the live path, so a replayed store
//! matches the live one up to update-order rounding.

use formlern_bandits::{
    ApplyOutcome, ConfigError, EngineConfig, MemoryDecisionLog, OnlineUpdateEngine,
    PosteriorStore, RewardFunction, StoreSnapshot, ThompsonSampler,
};
use formlern_core::{DecisionRecord, DecisionSink, FeedbackEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("decision '{0}' appears twice in the log")]
    DuplicateDecision(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Parses newline-delimited JSON, skipping blank lines.
///
/// # Errors
/// [`ReplayError::Parse`] with the 1-based line number of the first bad line.
pub fn parse_jsonl<T: DeserializeOwned>(input: &str) -> Result<Vec<T>, ReplayError> {
    input
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|source| ReplayError::Parse { line: i + 1, source })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub decisions: usize,
    pub acked: usize,
    pub duplicates: usize,
    /// Events applied on the retry pass after all decisions were loaded.
    pub retried: usize,
    /// Events whose decision never showed up.
    pub unresolved: Vec<String>,
    pub store: StoreSnapshot,
}

/// Incremental replay: records and events may be fed in batches, in the
/// order they were logged. Deferred events are retried once in
/// [`Replayer::finish`].
#[derive(Debug)]
pub struct Replayer {
    log: Arc<MemoryDecisionLog>,
    updates: OnlineUpdateEngine,
    pending: Vec<FeedbackEvent>,
    acked: usize,
    duplicates: usize,
}

impl Replayer {
    /// # Errors
    /// [`ReplayError::Config`] if the configuration does not validate.
    pub fn new(config: &EngineConfig, store: Arc<PosteriorStore>) -> Result<Self, ReplayError> {
        config.validate()?;
        let log = Arc::new(MemoryDecisionLog::new());
        let updates = OnlineUpdateEngine::new(
            store,
            log.clone(),
            RewardFunction::new(config.reward.clone()),
            ThompsonSampler::new(config.clustering.clone()),
        );
        Ok(Self {
            log,
            updates,
            pending: Vec::new(),
            acked: 0,
            duplicates: 0,
        })
    }

    /// # Errors
    /// [`ReplayError::DuplicateDecision`] on a repeated decision id.
    pub fn add_records(&mut self, records: impl IntoIterator<Item = DecisionRecord>) -> Result<(), ReplayError> {
        for record in records {
            let id = record.decision_id.clone();
            self.log
                .emit(&Arc::new(record))
                .map_err(|_| ReplayError::DuplicateDecision(id))?;
        }
        Ok(())
    }

    pub fn apply_events(&mut self, events: impl IntoIterator<Item = FeedbackEvent>) {
        for event in events {
            match self.updates.apply(&event) {
                ApplyOutcome::Ack { .. } => self.acked += 1,
                ApplyOutcome::Duplicate => self.duplicates += 1,
                ApplyOutcome::Deferred => self.pending.push(event),
            }
        }
    }

    /// Retries deferred events once and reports.
    #[must_use]
    pub fn finish(mut self) -> ReplayReport {
        let pending = std::mem::take(&mut self.pending);
        let mut retried = 0;
        let mut unresolved = Vec::new();
        for event in pending {
            match self.updates.apply(&event) {
                ApplyOutcome::Ack { .. } => {
                    self.acked += 1;
                    retried += 1;
                }
                ApplyOutcome::Duplicate => self.duplicates += 1,
                ApplyOutcome::Deferred => unresolved.push(event.event_id),
            }
        }
        tracing::info!(
            acked = self.acked,
            duplicates = self.duplicates,
            retried,
            unresolved = unresolved.len(),
            "replay finished"
        );
        ReplayReport {
            decisions: self.log.len(),
            acked: self.acked,
            duplicates: self.duplicates,
            retried,
            unresolved,
            store: self.updates.store().export(),
        }
    }

    /// One-shot replay into a fresh store built from `config.prior`.
    ///
    /// # Errors
    /// See [`Replayer::new`] and [`Replayer::add_records`].
    pub fn replay(
        config: &EngineConfig,
        records: Vec<DecisionRecord>,
        events: Vec<FeedbackEvent>,
    ) -> Result<ReplayReport, ReplayError> {
        let store = Arc::new(PosteriorStore::new(config.prior.clone()));
        let mut replayer = Self::new(config, store)?;
        replayer.add_records(records)?;
        replayer.apply_events(events);
        Ok(replayer.finish())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use formlern_core::{FeedbackEvent, Outcome};

    #[test]
    fn jsonl_reports_line_numbers() {
        let input = "{\"event_id\":\"e1\",\"decision_id\":\"d1\",\"outcome\":{\"completed\":true}}\n\n{oops}\n";
        let err = parse_jsonl::<FeedbackEvent>(input).expect_err("bad line");
        assert!(matches!(err, ReplayError::Parse { line: 3, .. }));
    }

    #[test]
    fn jsonl_skips_blank_lines() {
        let input = "\n{\"event_id\":\"e1\",\"decision_id\":\"d1\",\"outcome\":{\"completed\":false}}\n   \n";
        let events = parse_jsonl::<FeedbackEvent>(input).expect("parse");
        assert_eq!(events.len(), 1);
        assert!(!events[0].outcome.completed);
    }

    #[test]
    fn events_without_decisions_stay_unresolved() {
        let event = FeedbackEvent {
            event_id: "e1".into(),
            decision_id: "ghost".into(),
            ts: None,
            cohort: None,
            outcome: Outcome::default(),
        };
        let report = Replayer::replay(&EngineConfig::default(), vec![], vec![event]).expect("replay");
        assert_eq!(report.acked, 0);
        assert_eq!(report.unresolved, vec!["e1".to_string()]);
        assert!(report.store.cells.is_empty());
    }
}
