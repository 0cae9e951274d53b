use std::io::{self, Read};
use std::sync::Arc;

use formlern_bandits::{DecisionEngine, DecisionRequest, EngineConfig, MemoryDecisionLog, PosteriorStore};
use formlern_core::{FeatureKey, FeatureSnapshot};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    let snapshot = if input.trim().is_empty() {
        FeatureSnapshot::new("demo-user")
            .with(FeatureKey::Readiness, 72)
            .with(FeatureKey::Hrv, 55)
            .with(FeatureKey::SleepHours, 7)
            .with(FeatureKey::RestingHr, 58)
    } else {
        serde_json::from_str::<FeatureSnapshot>(&input)?
    };

    let config = EngineConfig::default();
    let store = Arc::new(PosteriorStore::new(config.prior.clone()));
    let engine = DecisionEngine::new(&config, store, Arc::new(MemoryDecisionLog::new()))?;

    let user = snapshot.user_id.clone();
    let record = engine.decide(&DecisionRequest::new("example-decision", user, snapshot))?;

    serde_json::to_writer_pretty(io::stdout(), &*record)?;
    println!();

    Ok(())
}
