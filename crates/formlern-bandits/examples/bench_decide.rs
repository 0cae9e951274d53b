use formlern_bandits::{
    build, CellKey, DecisionRequest, EngineConfig, MemoryDecisionLog, PosteriorStore,
};
use formlern_core::{ArmId, FeatureKey, FeatureSnapshot, FeedbackEvent, Outcome};
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::default();
    let store = Arc::new(PosteriorStore::new(config.prior.clone()));
    let log = Arc::new(MemoryDecisionLog::new());
    let (engine, updates) = build(&config, store, log)?;

    // Warm every cell past the blend threshold so the bandit path is exercised.
    for arm in engine.catalog().arms() {
        for _ in 0..20 {
            updates
                .store()
                .update_with(&CellKey::new(arm.id.clone(), 0), |p| p.updated(0.5));
        }
    }

    let snapshot = FeatureSnapshot::new("bench")
        .with(FeatureKey::Readiness, 80)
        .with(FeatureKey::Hrv, 60)
        .with(FeatureKey::SleepHours, 8)
        .with(FeatureKey::RestingHr, 55);

    let iterations: u32 = 50_000;
    let start = Instant::now();
    for i in 0..iterations {
        let request = DecisionRequest::new(format!("bench-{i}"), "bench", snapshot.clone());
        engine.decide_seeded(&request, u64::from(i))?;
    }
    let duration = start.elapsed();
    println!("Decisions took: {duration:?}");
    println!("Average per decision: {:?}", duration / iterations);

    let start = Instant::now();
    for i in 0..iterations {
        updates.apply(&FeedbackEvent {
            event_id: format!("bench-e{i}"),
            decision_id: format!("bench-{i}"),
            ts: None,
            cohort: None,
            outcome: Outcome {
                completed: i % 3 != 0,
                ..Outcome::default()
            },
        });
    }
    let duration = start.elapsed();
    println!("Feedback took: {duration:?}");
    println!("Average per event: {:?}", duration / iterations);
    println!(
        "Observations on cardio_high: {}",
        updates
            .store()
            .get(&CellKey::new(ArmId::from("cardio_high"), 0))
            .observations
    );
    Ok(())
}
