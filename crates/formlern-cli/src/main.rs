//! CLI for formlern.
//!
//! Runs decisions against persisted posterior state, applies feedback from
//! JSONL files with a resumable line cursor, and replays or analyzes the
//! logs offline. JSON results go to stdout, logs to stderr.

mod sink;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formlern_bandits::{
    ApplyOutcome, DecisionEngine, DecisionRequest, EngineConfig, ExperimentAllocator,
    MemoryDecisionLog, OnlineUpdateEngine, PosteriorStore, RewardFunction, StoreSnapshot,
    ThompsonSampler,
};
use formlern_core::{DecisionRecord, FeatureSnapshot, FeedbackEvent};
use formlern_feedback::{parse_jsonl, OutcomeAnalyzer, ReplayReport, Replayer};
use serde::{Deserialize, Serialize};
use sink::{read_records, JsonlDecisionLog};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recommend a session for one request (file or stdin)
    Decide {
        /// Decision request or bare feature snapshot (JSON); stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Fixed sampling seed, reproduces the decision
        #[arg(long)]
        seed: Option<u64>,

        /// Path to the state file
        #[arg(long, default_value = "data/formlern.state.json")]
        state_file: PathBuf,

        /// Path to the append-only decision log
        #[arg(long, default_value = "data/formlern.decisions.jsonl")]
        log_file: PathBuf,
    },
    /// Apply feedback events from a JSONL file
    Feedback {
        /// Input file path
        #[arg(long)]
        path: PathBuf,

        /// Start from line number (0-based) - overrides state
        #[arg(long)]
        line_offset: Option<u64>,

        /// Path to the state file
        #[arg(long, default_value = "data/formlern.state.json")]
        state_file: PathBuf,

        /// Path to the append-only decision log
        #[arg(long, default_value = "data/formlern.decisions.jsonl")]
        log_file: PathBuf,
    },
    /// Rebuild posterior state from the decision log and an event log
    Replay {
        /// Feedback events (JSONL)
        #[arg(long)]
        events: PathBuf,

        /// Path to the append-only decision log
        #[arg(long, default_value = "data/formlern.decisions.jsonl")]
        log_file: PathBuf,

        /// Write the rebuilt state to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Outcome statistics by arm and cohort
    Report {
        /// Feedback events (JSONL)
        #[arg(long)]
        events: PathBuf,

        /// Path to the append-only decision log
        #[arg(long, default_value = "data/formlern.decisions.jsonl")]
        log_file: PathBuf,

        /// Outcomes an arm needs before it can be flagged
        #[arg(long, default_value = "10")]
        min_outcomes: usize,
    },
    /// Show the experiment cohort of a user
    Assign {
        #[arg(long)]
        user: String,

        /// Defaults to the configured active experiment
        #[arg(long)]
        experiment: Option<String>,
    },
    /// Write the default configuration
    InitConfig {
        /// Output path; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Persisted engine state shared by `decide`, `feedback` and `replay`.
#[derive(Serialize, Deserialize, Debug, Default)]
struct EngineState {
    /// Next unread line of `source`.
    cursor: u64,
    /// Event file the cursor refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<PathBuf>,
    #[serde(default)]
    store: StoreSnapshot,
    /// Events whose decision was not in the log yet; retried on the next run.
    #[serde(default)]
    pending: Vec<FeedbackEvent>,
    #[serde(default, with = "time::serde::iso8601::option")]
    last_ok: Option<OffsetDateTime>,
    #[serde(default)]
    last_error: Option<String>,
}

impl EngineState {
    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let state = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid state file {path:?}"))?;
        Ok(Some(state))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    fn check_source(&self, path: &Path) -> Result<()> {
        match &self.source {
            Some(source) if source != path => anyhow::bail!(
                "State file source mismatch: cursor belongs to {:?}, got {:?} (pass --line-offset to start over)",
                source,
                path
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Debug, Default, PartialEq)]
struct FeedbackSummary {
    acked: usize,
    duplicates: usize,
    deferred: usize,
    cursor: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DecideInput {
    Request(DecisionRequest),
    Snapshot(FeatureSnapshot),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_path(p).with_context(|| format!("Failed to load config {p:?}")),
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value)?;
    println!();
    Ok(())
}

/// A bare snapshot gets a fresh request id and its user id as user key.
fn parse_request(raw: &str) -> Result<DecisionRequest> {
    let input: DecideInput = serde_json::from_str(raw)
        .context("Input is neither a decision request nor a feature snapshot")?;
    Ok(match input {
        DecideInput::Request(request) => request,
        DecideInput::Snapshot(snapshot) => {
            let user = snapshot.user_id.clone();
            DecisionRequest::new(Uuid::new_v4().to_string(), user, snapshot)
        }
    })
}

fn run_decide(
    config: &EngineConfig,
    input: Option<&Path>,
    seed: Option<u64>,
    state_file: &Path,
    log_file: &Path,
) -> Result<Arc<DecisionRecord>> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request {path:?}"))?,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let request = parse_request(&raw)?;

    let snapshot = EngineState::load(state_file)?
        .map(|s| s.store)
        .unwrap_or_default();
    let store = Arc::new(PosteriorStore::import(config.prior.clone(), snapshot));
    let sink = Arc::new(JsonlDecisionLog::open(log_file)?);
    tracing::debug!(log = ?sink.path(), version = store.version(), "engine state loaded");

    let engine = DecisionEngine::new(config, store, sink)?;
    let record = match seed {
        Some(seed) => engine.decide_seeded(&request, seed)?,
        None => engine.decide(&request)?,
    };
    Ok(record)
}

/// Reads events from line `offset` on; returns them with the next cursor.
fn read_events(path: &Path, offset: u64) -> Result<(Vec<FeedbackEvent>, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open event file {path:?}"))?;
    let reader = BufReader::new(f);
    let mut events = Vec::new();
    let mut lines_read: u64 = 0;

    for (idx, line) in reader.lines().enumerate() {
        if (idx as u64) < offset {
            continue;
        }
        let line = line?;
        lines_read += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: FeedbackEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid feedback event on line {}", idx + 1))?;
        events.push(event);
    }

    let next_offset = offset.checked_add(lines_read).context("Cursor overflow")?;
    Ok((events, next_offset))
}

fn apply_feedback(
    config: &EngineConfig,
    previous: &EngineState,
    path: &Path,
    cursor: u64,
    log_file: &Path,
) -> Result<(EngineState, FeedbackSummary)> {
    let records = read_records(log_file)?;
    let log = MemoryDecisionLog::from_records(records)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid decision log")?;
    let store = Arc::new(PosteriorStore::import(
        config.prior.clone(),
        previous.store.clone(),
    ));
    let updates = OnlineUpdateEngine::new(
        store,
        Arc::new(log),
        RewardFunction::new(config.reward.clone()),
        ThompsonSampler::new(config.clustering.clone()),
    );

    let (events, next_cursor) = read_events(path, cursor)?;
    let mut summary = FeedbackSummary {
        cursor: next_cursor,
        ..FeedbackSummary::default()
    };
    let mut pending: Vec<FeedbackEvent> = Vec::new();
    for event in previous.pending.iter().cloned().chain(events) {
        match updates.apply(&event) {
            ApplyOutcome::Ack { .. } => summary.acked += 1,
            ApplyOutcome::Duplicate => summary.duplicates += 1,
            ApplyOutcome::Deferred => {
                if !pending.iter().any(|p| p.event_id == event.event_id) {
                    pending.push(event);
                }
            }
        }
    }
    summary.deferred = pending.len();

    let state = EngineState {
        cursor: next_cursor,
        source: Some(path.to_path_buf()),
        store: updates.store().export(),
        pending,
        last_ok: Some(OffsetDateTime::now_utc()),
        last_error: None,
    };
    Ok((state, summary))
}

fn record_state_error(state_file: &Path, err_msg: &str) -> Result<()> {
    // Keep cursor, store and last_ok of the previous run
    let mut state = match EngineState::load(state_file) {
        Ok(Some(s)) => s,
        _ => EngineState::default(),
    };
    state.last_error = Some(err_msg.to_string());

    if let Err(e) = state.save(state_file) {
        tracing::error!(
            state_file = ?state_file,
            original = err_msg,
            error = %e,
            "failed to save error state"
        );
        return Err(e);
    }
    Ok(())
}

fn run_feedback(
    config: &EngineConfig,
    path: &Path,
    line_offset: Option<u64>,
    state_file: &Path,
    log_file: &Path,
) -> Result<FeedbackSummary> {
    let previous = EngineState::load(state_file)?.unwrap_or_default();
    if line_offset.is_none() {
        previous.check_source(path)?;
        if previous.cursor > 0 {
            tracing::info!(cursor = previous.cursor, "resuming from state cursor");
        }
    }
    let cursor = line_offset.unwrap_or(previous.cursor);

    match apply_feedback(config, &previous, path, cursor, log_file) {
        Ok((state, summary)) => {
            state.save(state_file).context("Failed to save state")?;
            tracing::info!(
                acked = summary.acked,
                duplicates = summary.duplicates,
                deferred = summary.deferred,
                cursor = summary.cursor,
                "feedback applied"
            );
            Ok(summary)
        }
        Err(e) => {
            let err_msg = format!("{e:#}");
            tracing::error!(error = %err_msg, "feedback ingest failed");
            if let Err(save_err) = record_state_error(state_file, &err_msg) {
                tracing::error!(error = %save_err, "failed to record error state");
            }
            Err(e.context("Feedback cycle failed"))
        }
    }
}

fn read_all_events(path: &Path) -> Result<(Vec<FeedbackEvent>, u64)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file {path:?}"))?;
    let lines = raw.lines().count() as u64;
    let events = parse_jsonl(&raw).with_context(|| format!("Invalid event file {path:?}"))?;
    Ok((events, lines))
}

fn run_replay(
    config: &EngineConfig,
    events_path: &Path,
    log_file: &Path,
    out: Option<&Path>,
) -> Result<ReplayReport> {
    let records = read_records(log_file)?;
    let (events, lines) = read_all_events(events_path)?;
    let report = Replayer::replay(config, records, events.clone())?;

    if let Some(out) = out {
        let pending = events
            .into_iter()
            .filter(|e| report.unresolved.contains(&e.event_id))
            .collect();
        EngineState {
            cursor: lines,
            source: Some(events_path.to_path_buf()),
            store: report.store.clone(),
            pending,
            last_ok: Some(OffsetDateTime::now_utc()),
            last_error: None,
        }
        .save(out)
        .context("Failed to save replayed state")?;
    }
    Ok(report)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Decide {
            input,
            seed,
            state_file,
            log_file,
        } => {
            let config = load_config(config_path.as_deref())?;
            let record = run_decide(&config, input.as_deref(), seed, &state_file, &log_file)?;
            print_json(&*record)?;
        }
        Commands::Feedback {
            path,
            line_offset,
            state_file,
            log_file,
        } => {
            let config = load_config(config_path.as_deref())?;
            let summary = run_feedback(&config, &path, line_offset, &state_file, &log_file)?;
            print_json(&summary)?;
        }
        Commands::Replay {
            events,
            log_file,
            out,
        } => {
            let config = load_config(config_path.as_deref())?;
            let report = run_replay(&config, &events, &log_file, out.as_deref())?;
            print_json(&report)?;
        }
        Commands::Report {
            events,
            log_file,
            min_outcomes,
        } => {
            let config = load_config(config_path.as_deref())?;
            let records = read_records(&log_file)?;
            let (events, _) = read_all_events(&events)?;
            let analyzer = OutcomeAnalyzer::new(min_outcomes, RewardFunction::new(config.reward));
            print_json(&analyzer.report(&records, &events))?;
        }
        Commands::Assign { user, experiment } => {
            let config = load_config(config_path.as_deref())?;
            let experiment = experiment
                .or_else(|| config.active_experiment.clone())
                .context("No experiment given and none active in the config")?;
            let allocator = ExperimentAllocator::new(config.experiments);
            let cohort = allocator
                .assign(&user, &experiment)
                .with_context(|| format!("Unknown experiment '{experiment}'"))?;
            print_json(&cohort)?;
        }
        Commands::InitConfig { out } => {
            let config = EngineConfig::default();
            match out {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {path:?}"))?;
                    serde_json::to_writer_pretty(file, &config)?;
                }
                None => print_json(&config)?,
            }
        }
    }

    Ok(())
}
