//! Example: run simulated decisions, feed outcomes back, and analyze them.
//!
//! Run with: cargo run -p formlern-feedback --example outcome_analysis

use formlern_bandits::{build, DecisionRequest, EngineConfig, ExperimentConfig, MemoryDecisionLog, PosteriorStore};
use formlern_core::{FeatureKey, FeatureSnapshot, FeedbackEvent, Outcome};
use formlern_feedback::{OutcomeAnalyzer, Replayer};
use std::error::Error;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn Error>> {
    println!("=== formlern: outcome analysis ===\n");

    let mut config = EngineConfig::default();
    config.experiments = vec![ExperimentConfig::hybrid_vs_rules("hybrid-vs-rules")];
    config.active_experiment = Some("hybrid-vs-rules".to_string());

    let store = Arc::new(PosteriorStore::new(config.prior.clone()));
    let log = Arc::new(MemoryDecisionLog::new());
    let (engine, updates) = build(&config, store, log.clone())?;

    let mut events = Vec::new();
    for i in 0..120_u32 {
        let readiness = 45 + (i * 7) % 50;
        let snapshot = FeatureSnapshot::new(format!("user-{}", i % 24))
            .with(FeatureKey::Readiness, readiness)
            .with(FeatureKey::Hrv, 40 + i % 30)
            .with(FeatureKey::SleepHours, 7)
            .with(FeatureKey::RestingHr, 58)
            .with(FeatureKey::Fatigue, 2 + i % 6);
        let user = snapshot.user_id.clone();
        let record = engine.decide_seeded(&DecisionRequest::new(format!("d{i}"), user, snapshot), u64::from(i))?;

        // High-intensity sessions get abandoned more often in this simulation.
        let hard = record.selected.as_str().ends_with("_high");
        let completed = if hard { i % 3 == 0 } else { i % 5 != 0 };
        let event = FeedbackEvent {
            event_id: format!("e{i}"),
            decision_id: record.decision_id.clone(),
            ts: None,
            cohort: record.cohort.clone(),
            outcome: Outcome {
                completed,
                rpe: Some(if hard { 9.0 } else { 6.0 }),
                mood: Some(if completed { 4.0 } else { 2.0 }),
                ..Outcome::default()
            },
        };
        updates.apply(&event);
        events.push(event);
    }

    let records: Vec<_> = log.records().iter().map(|r| (**r).clone()).collect();
    let analyzer = OutcomeAnalyzer::new(5, updates.reward_function().clone());
    let report = analyzer.report(&records, &events);

    println!("Statistics by arm:");
    for (arm, stats) in &report.by_arm {
        println!(
            "  {} → success: {}/{} ({:.1}%), avg reward: {:.2}",
            arm,
            stats.successes,
            stats.total,
            stats.success_rate() * 100.0,
            stats.average_reward()
        );
    }
    println!("\nStatistics by cohort:");
    for (cohort, stats) in &report.by_cohort {
        println!("  {} → avg reward: {:.2} over {}", cohort, stats.average_reward(), stats.total);
    }

    println!("\nPatterns:");
    if report.patterns.is_empty() {
        println!("  (none detected with current thresholds)");
    }
    for pattern in &report.patterns {
        println!("  • {pattern}");
    }

    let replayed = Replayer::replay(&config, records, events)?;
    println!(
        "\nReplay: {} acked, {} cells, live store version {}",
        replayed.acked,
        replayed.store.cells.len(),
        updates.store().version()
    );
    Ok(())
}
