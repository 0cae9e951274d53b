//! Arena of per-(arm, cluster) posterior cells.
//!
//! Readers never lock: the cell index and every cell's current posterior sit
//! behind `ArcSwap`, so a decision takes a consistent snapshot with a handful
//! of atomic loads. Writers serialize per cell on a narrow mutex; updates to
//! different cells run in parallel.

use crate::posterior::{Posterior, PosteriorFault, PriorConfig};
use arc_swap::ArcSwap;
use formlern_core::{ArmId, ClusterId, FaultNote};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Address of one posterior cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub arm: ArmId,
    pub cluster: ClusterId,
}

impl CellKey {
    #[must_use]
    pub fn new(arm: ArmId, cluster: ClusterId) -> Self {
        Self { arm, cluster }
    }
}

struct Cell {
    current: ArcSwap<Posterior>,
    write: Mutex<()>,
}

impl Cell {
    fn new(posterior: Posterior) -> Self {
        Self {
            current: ArcSwap::from_pointee(posterior),
            write: Mutex::new(()),
        }
    }
}

/// Result of one serialized cell update.
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub posterior: Posterior,
    /// Set when the stored posterior was corrupt and reset to its prior first.
    pub reset: Option<PosteriorFault>,
    /// Store version after the update.
    pub version: u64,
}

/// Read-only view of the cells one decision needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSnapshot {
    version: u64,
    entries: BTreeMap<CellKey, Posterior>,
    faults: Vec<FaultNote>,
}

impl PosteriorSnapshot {
    #[must_use]
    pub fn get(&self, key: &CellKey) -> Option<&Posterior> {
        self.entries.get(key)
    }

    /// Store version observed when the snapshot was taken.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Cells whose stored posterior failed validation; the snapshot holds
    /// their prior instead.
    #[must_use]
    pub fn faults(&self) -> &[FaultNote] {
        &self.faults
    }
}

/// Serializable store state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoreSnapshot {
    pub version: u64,
    pub cells: Vec<CellEntry>,
    /// Event ids already applied, for idempotency across restarts.
    pub applied_events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEntry {
    pub key: CellKey,
    pub posterior: Posterior,
}

pub struct PosteriorStore {
    priors: PriorConfig,
    cells: ArcSwap<HashMap<CellKey, Arc<Cell>>>,
    applied: Mutex<HashSet<String>>,
    version: AtomicU64,
}

impl fmt::Debug for PosteriorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosteriorStore")
            .field("cells", &self.cells.load().len())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl PosteriorStore {
    #[must_use]
    pub fn new(priors: PriorConfig) -> Self {
        Self {
            priors,
            cells: ArcSwap::from_pointee(HashMap::new()),
            applied: Mutex::new(HashSet::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Restores a store exported with [`PosteriorStore::export`].
    ///
    /// Stored posteriors are taken as-is; corrupt cells are detected and
    /// contained on read.
    #[must_use]
    pub fn import(priors: PriorConfig, snapshot: StoreSnapshot) -> Self {
        let cells = snapshot
            .cells
            .into_iter()
            .map(|e| (e.key, Arc::new(Cell::new(e.posterior))))
            .collect();
        Self {
            priors,
            cells: ArcSwap::from_pointee(cells),
            applied: Mutex::new(snapshot.applied_events.into_iter().collect()),
            version: AtomicU64::new(snapshot.version),
        }
    }

    #[must_use]
    pub fn export(&self) -> StoreSnapshot {
        let cells = self.cells.load();
        let mut entries: Vec<CellEntry> = cells
            .iter()
            .map(|(key, cell)| CellEntry {
                key: key.clone(),
                posterior: **cell.current.load(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let mut applied: Vec<String> = self.applied.lock().iter().cloned().collect();
        applied.sort();
        StoreSnapshot {
            version: self.version(),
            cells: entries,
            applied_events: applied,
        }
    }

    #[must_use]
    pub fn priors(&self) -> &PriorConfig {
        &self.priors
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.load().len()
    }

    /// Current posterior of `key`, or its prior if the cell does not exist.
    #[must_use]
    pub fn get(&self, key: &CellKey) -> Posterior {
        self.cells
            .load()
            .get(key)
            .map_or_else(|| self.priors.prior_for(&key.arm), |c| **c.current.load())
    }

    /// Consistent read of `keys`. Never blocks on writers.
    #[must_use]
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a CellKey>) -> PosteriorSnapshot {
        let version = self.version();
        let cells = self.cells.load();
        let mut entries = BTreeMap::new();
        let mut faults = Vec::new();
        for key in keys {
            let posterior = match cells.get(key) {
                Some(cell) => {
                    let stored = **cell.current.load();
                    match stored.check() {
                        Ok(()) => stored,
                        Err(fault) => {
                            tracing::error!(
                                arm = %key.arm,
                                cluster = key.cluster,
                                %fault,
                                "corrupt posterior, using prior for this decision"
                            );
                            faults.push(FaultNote {
                                arm: key.arm.clone(),
                                cluster: key.cluster,
                                detail: fault.to_string(),
                            });
                            self.priors.prior_for(&key.arm)
                        }
                    }
                }
                None => self.priors.prior_for(&key.arm),
            };
            entries.insert(key.clone(), posterior);
        }
        PosteriorSnapshot {
            version,
            entries,
            faults,
        }
    }

    /// Marks `event_id` as applied. Returns `false` if it already was.
    pub fn claim_event(&self, event_id: &str) -> bool {
        let mut applied = self.applied.lock();
        if applied.contains(event_id) {
            return false;
        }
        applied.insert(event_id.to_string())
    }

    #[must_use]
    pub fn is_applied(&self, event_id: &str) -> bool {
        self.applied.lock().contains(event_id)
    }

    /// Replaces the posterior of `key` with `f(current)` inside the cell's
    /// critical section. A corrupt current value is reset to the prior before
    /// `f` sees it.
    pub fn update_with<F>(&self, key: &CellKey, f: F) -> CellUpdate
    where
        F: FnOnce(&Posterior) -> Posterior,
    {
        let cell = self.cell(key);
        let _guard = cell.write.lock();
        let current = **cell.current.load();
        let (base, reset) = match current.check() {
            Ok(()) => (current, None),
            Err(fault) => {
                tracing::error!(
                    arm = %key.arm,
                    cluster = key.cluster,
                    %fault,
                    "corrupt posterior reset to prior"
                );
                (self.priors.prior_for(&key.arm), Some(fault))
            }
        };
        let next = f(&base);
        cell.current.store(Arc::new(next));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        CellUpdate {
            posterior: next,
            reset,
            version,
        }
    }

    /// Resets every corrupt cell to its prior. Returns the cells touched.
    pub fn heal(&self) -> Vec<(CellKey, PosteriorFault)> {
        let cells = self.cells.load_full();
        let mut healed = Vec::new();
        for (key, cell) in cells.iter() {
            let _guard = cell.write.lock();
            if let Err(fault) = cell.current.load().check() {
                tracing::error!(arm = %key.arm, cluster = key.cluster, %fault, "healing corrupt posterior");
                cell.current.store(Arc::new(self.priors.prior_for(&key.arm)));
                self.version.fetch_add(1, Ordering::AcqRel);
                healed.push((key.clone(), fault));
            }
        }
        healed.sort_by(|a, b| a.0.cmp(&b.0));
        healed
    }

    /// Overwrites a cell without validation. Used by import tooling and tests
    /// that need to plant a specific state.
    pub fn force_set(&self, key: &CellKey, posterior: Posterior) {
        let cell = self.cell(key);
        let _guard = cell.write.lock();
        cell.current.store(Arc::new(posterior));
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn cell(&self, key: &CellKey) -> Arc<Cell> {
        if let Some(cell) = self.cells.load().get(key) {
            return Arc::clone(cell);
        }
        let fresh = Arc::new(Cell::new(self.priors.prior_for(&key.arm)));
        self.cells.rcu(|cells| {
            let mut next = HashMap::clone(cells);
            next.entry(key.clone()).or_insert_with(|| Arc::clone(&fresh));
            next
        });
        self.cells
            .load()
            .get(key)
            .map_or(fresh, Arc::clone)
    }
}
