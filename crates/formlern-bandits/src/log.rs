//! In-memory decision log.

use formlern_core::{DecisionLookup, DecisionRecord, DecisionSink, SinkError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    order: Vec<Arc<DecisionRecord>>,
    by_id: HashMap<String, Arc<DecisionRecord>>,
}

/// Append-only store of emitted records, usable as both sink and lookup.
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    inner: RwLock<Inner>,
}

impl MemoryDecisionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the log with existing records, e.g. loaded from disk.
    ///
    /// # Errors
    /// The first duplicate decision id.
    pub fn from_records(records: impl IntoIterator<Item = DecisionRecord>) -> Result<Self, SinkError> {
        let log = Self::new();
        for record in records {
            log.emit(&Arc::new(record))?;
        }
        Ok(log)
    }

    /// Records in emission order.
    #[must_use]
    pub fn records(&self) -> Vec<Arc<DecisionRecord>> {
        self.inner.read().order.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }
}

impl DecisionSink for MemoryDecisionLog {
    fn emit(&self, record: &Arc<DecisionRecord>) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&record.decision_id) {
            return Err(format!("decision '{}' already recorded", record.decision_id).into());
        }
        inner
            .by_id
            .insert(record.decision_id.clone(), Arc::clone(record));
        inner.order.push(Arc::clone(record));
        Ok(())
    }
}

impl DecisionLookup for MemoryDecisionLog {
    fn find(&self, decision_id: &str) -> Option<Arc<DecisionRecord>> {
        self.inner.read().by_id.get(decision_id).cloned()
    }
}
