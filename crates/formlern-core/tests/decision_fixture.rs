use formlern_core::{
    ArmId, DecisionRecord, DecisionStage, FeatureKey, FeedbackEvent, Goal,
};
use std::fs;

#[test]
fn decision_record_fixture_deserializes() {
    let content = fs::read_to_string("../../tests/fixtures/decision/sample.ok.json")
        .expect("Failed to read fixture file");
    let record: DecisionRecord =
        serde_json::from_str(&content).expect("Failed to deserialize decision fixture");

    assert_eq!(record.selected, ArmId::from("cardio_medium"));
    assert_eq!(record.context.goal, Some(Goal::Endurance));
    assert_eq!(record.context.number(FeatureKey::Soreness), Some(8.0));
    assert_eq!(record.context.flag(FeatureKey::InjuryFlag), Some(false));
    let defaulted: Vec<FeatureKey> = record.context.defaulted().collect();
    assert_eq!(defaulted, vec![FeatureKey::Fatigue, FeatureKey::InjuryFlag]);

    assert!(record.is_vetoed(&ArmId::from("strength_high")));
    assert!(record.score_of(&ArmId::from("strength_high")).is_none());
    assert_eq!(
        record.score_of(&ArmId::from("rest")).and_then(|s| s.bandit),
        None
    );
    assert_eq!(record.stages.last(), Some(&DecisionStage::Emitted));
    assert!(record.forced_default.is_none());
    assert!(record.faults.is_empty());
}

#[test]
fn decision_record_survives_reserialization() {
    let content = fs::read_to_string("../../tests/fixtures/decision/sample.ok.json")
        .expect("Failed to read fixture file");
    let record: DecisionRecord = serde_json::from_str(&content).expect("deserialize");
    let json = serde_json::to_string(&record).expect("serialize");
    assert!(json.contains("\"final\":"));
    assert!(!json.contains("forced_default"));
    let again: DecisionRecord = serde_json::from_str(&json).expect("deserialize again");
    assert_eq!(record, again);
}

#[test]
fn feedback_fixture_parses_line_by_line() {
    let content = fs::read_to_string("../../tests/fixtures/feedback/events.jsonl")
        .expect("Failed to read fixture file");
    let events: Vec<FeedbackEvent> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("valid event line"))
        .collect();

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].outcome.rpe, Some(6.0));
    assert_eq!(events[0].event_id, events[1].event_id);
    assert!(events[2].outcome.injury);
    assert!(events[2].ts.is_none());
}
