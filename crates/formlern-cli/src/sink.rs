//! Append-only JSONL decision log on disk.

use anyhow::{Context, Result};
use formlern_core::{DecisionRecord, DecisionSink, SinkError};
use formlern_feedback::parse_jsonl;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One serialized record per line; lines are never rewritten.
pub struct JsonlDecisionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlDecisionLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open decision log {path:?}"))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionSink for JsonlDecisionLog {
    fn emit(&self, record: &Arc<DecisionRecord>) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record.as_ref())?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Reads a decision log; a missing file is an empty log.
pub fn read_records(path: &Path) -> Result<Vec<DecisionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read decision log {path:?}"))?;
    parse_jsonl(&input).with_context(|| format!("Invalid decision log {path:?}"))
}
