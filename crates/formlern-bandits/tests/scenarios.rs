#![allow(clippy::expect_used, clippy::unwrap_used)]

use formlern_bandits::{
    build, ApplyOutcome, CellKey, Condition, DecisionEngine, DecisionRequest, EngineConfig,
    MemoryDecisionLog, OnlineUpdateEngine, PosteriorStore, RuleAction, RuleSet, SafetyRule,
    SamplingMode,
};
use formlern_core::{
    ArmId, DecisionLookup, DecisionStage, FeatureKey, FeatureSnapshot, FeedbackEvent, Intensity,
    Outcome,
};
use std::sync::Arc;
use std::thread;

struct Harness {
    engine: DecisionEngine,
    updates: OnlineUpdateEngine,
    log: Arc<MemoryDecisionLog>,
}

fn harness(config: &EngineConfig) -> Harness {
    let log = Arc::new(MemoryDecisionLog::new());
    let store = Arc::new(PosteriorStore::new(config.prior.clone()));
    let (engine, updates) = build(config, store, log.clone()).expect("valid config");
    Harness {
        engine,
        updates,
        log,
    }
}

fn baseline(user: &str) -> FeatureSnapshot {
    FeatureSnapshot::new(user)
        .with(FeatureKey::Readiness, 78)
        .with(FeatureKey::Hrv, 58)
        .with(FeatureKey::SleepHours, 7.2)
        .with(FeatureKey::RestingHr, 56)
        .with(FeatureKey::Fatigue, 4)
}

fn completed(event_id: &str, decision_id: &str) -> FeedbackEvent {
    FeedbackEvent {
        event_id: event_id.to_string(),
        decision_id: decision_id.to_string(),
        ts: None,
        cohort: None,
        outcome: Outcome {
            completed: true,
            satisfaction: Some(0.9),
            ..Outcome::default()
        },
    }
}

#[test]
fn injured_user_with_low_readiness_gets_active_recovery() {
    let h = harness(&EngineConfig::default());
    let snap = baseline("u1")
        .with(FeatureKey::Readiness, 40)
        .with(FeatureKey::Hrv, 15)
        .with(FeatureKey::InjuryFlag, true);
    let record = h
        .engine
        .decide(&DecisionRequest::new("d-injury", "u1", snap))
        .expect("decision");
    assert_eq!(record.selected.as_str(), "active_recovery");
    let forced = record.forced_default.as_ref().expect("forced default");
    assert_eq!(forced.rule, "injury_flag");
    assert_eq!(record.vetoes.len(), h.engine.catalog().len() - 1);
    assert!(!record.stages.contains(&DecisionStage::Scored));
}

#[test]
fn cold_start_uses_rule_scores_only() {
    let h = harness(&EngineConfig::default());
    let record = h
        .engine
        .decide(&DecisionRequest::new("d1", "u1", baseline("u1")))
        .expect("decision");
    assert!(record.scores.iter().all(|s| s.observations == 0
        && s.bandit.is_none()
        && s.bandit_weight.abs() < f64::EPSILON
        && (s.final_score - s.rule).abs() < f64::EPSILON));
}

#[test]
fn identical_request_seeds_give_identical_top_arm() {
    let config = EngineConfig {
        sampling: SamplingMode::PerRequestSeeded,
        ..EngineConfig::default()
    };
    let first = harness(&config);
    let second = harness(&config);
    for h in [&first, &second] {
        for i in 0..30 {
            h.updates.store().update_with(
                &CellKey::new(ArmId::from(if i % 2 == 0 { "cardio_medium" } else { "strength_medium" }), 0),
                |p| p.updated(0.6),
            );
        }
    }
    let a = first
        .engine
        .decide(&DecisionRequest::new("req-7", "u1", baseline("u1")))
        .expect("decision");
    let b = second
        .engine
        .decide(&DecisionRequest::new("req-7", "u1", baseline("u1")))
        .expect("decision");
    assert_eq!(a.seed, b.seed);
    assert_eq!(a.selected, b.selected);
    assert_eq!(a.scores, b.scores);
}

#[test]
fn feedback_for_unknown_decision_is_deferred() {
    let h = harness(&EngineConfig::default());
    assert_eq!(
        h.updates.apply(&completed("e1", "never-issued")),
        ApplyOutcome::Deferred
    );
    assert!(h.log.find("never-issued").is_none());
}

#[test]
fn redelivered_event_is_applied_once() {
    let h = harness(&EngineConfig::default());
    let record = h
        .engine
        .decide(&DecisionRequest::new("d1", "u1", baseline("u1")))
        .expect("decision");
    let event = completed("e1", "d1");
    assert!(matches!(h.updates.apply(&event), ApplyOutcome::Ack { .. }));
    for _ in 0..5 {
        assert_eq!(h.updates.apply(&event), ApplyOutcome::Duplicate);
    }
    let cell = h
        .updates
        .store()
        .get(&CellKey::new(record.selected.clone(), record.cluster));
    assert_eq!(cell.observations, 1);
}

#[test]
fn parallel_feedback_loses_no_update() {
    let h = harness(&EngineConfig::default());
    let decisions: Vec<String> = (0..64)
        .map(|i| {
            let id = format!("d{i}");
            h.engine
                .decide_seeded(&DecisionRequest::new(id.clone(), "u1", baseline("u1")), i)
                .expect("decision");
            id
        })
        .collect();
    let updates = Arc::new(h.updates);

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let updates = Arc::clone(&updates);
            let decisions = decisions.clone();
            thread::spawn(move || {
                for (i, d) in decisions.iter().enumerate() {
                    // Every worker delivers every event: each is applied exactly once.
                    let _ = updates.apply(&completed(&format!("e{i}"), d));
                    let _ = updates.apply(&completed(&format!("w{w}-e{i}"), d));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker");
    }

    let total: u64 = h
        .log
        .records()
        .iter()
        .map(|r| r.selected.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .map(|arm| updates.store().get(&CellKey::new(arm, 0)).observations)
        .sum();
    assert_eq!(total, 64 + 8 * 64);
}

#[test]
fn rule_reload_is_observed_atomically() {
    let h = harness(&EngineConfig::default());
    let mut strict = RuleSet::standard();
    strict.version = "strict-1".to_string();
    strict.rules.push(SafetyRule {
        name: "cap_everything".to_string(),
        when: Condition::AtLeast {
            feature: FeatureKey::Readiness,
            value: 0.0,
        },
        action: RuleAction::MaxIntensity {
            max: Intensity::Low,
        },
        reason: "deload week".to_string(),
    });

    let before = h
        .engine
        .decide(&DecisionRequest::new("d1", "u1", baseline("u1")))
        .expect("decision");
    assert!(before.vetoes.is_empty());

    let old = h.engine.reload_rules(strict);
    assert_eq!(old.version, "standard-1");

    let after = h
        .engine
        .decide(&DecisionRequest::new("d2", "u1", baseline("u1")))
        .expect("decision");
    assert_eq!(h.engine.rules().version, "strict-1");
    assert!(after.vetoes.iter().all(|v| v.rule == "cap_everything"));
    assert_eq!(after.vetoes.len(), 4);
    let arm = h.engine.catalog().get(after.selected.as_str()).expect("arm");
    assert!(arm.intensity <= Intensity::Low);
}
