//! Identifier → LoopState store shared between the loop manager and readers.
//!
//! Entries are sharded by `DashMap`. Only this crate writes (one writer per
//! loop id, the manager driving it); everyone else gets cloned snapshots and
//! never holds a live reference across an await.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::{HaltReason, LoopId, LoopState, LoopStatus};

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSummary {
    pub loop_id: LoopId,
    pub cycle: String,
    pub status: LoopStatus,
    pub halt_reason: Option<HaltReason>,
    pub step: u32,
    pub score: Option<f64>,
    pub started_at: DateTime<Utc>,
}

impl From<&LoopState> for LoopSummary {
    fn from(state: &LoopState) -> Self {
        Self {
            loop_id: state.id.clone(),
            cycle: state.cycle.clone(),
            status: state.status,
            halt_reason: state.halt_reason,
            step: state.step,
            score: state.score(),
            started_at: state.started_at,
        }
    }
}

#[derive(Default)]
pub struct LoopRegistry {
    loops: DashMap<LoopId, LoopState>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new loop. Returns false if the id is already taken.
    pub(crate) fn insert(&self, state: LoopState) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.loops.entry(state.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(loop_id = %state.id, "Registered loop");
                slot.insert(state);
                true
            }
        }
    }

    /// Replace the stored snapshot of a loop with the writer's current state.
    pub(crate) fn update(&self, state: &LoopState) {
        if let Some(mut entry) = self.loops.get_mut(&state.id) {
            *entry = state.clone();
        }
    }

    /// Snapshot of one loop.
    pub fn get(&self, id: &str) -> Option<LoopState> {
        self.loops.get(id).map(|entry| entry.clone())
    }

    /// Summaries of every registered loop, newest first.
    pub fn list(&self) -> Vec<LoopSummary> {
        let mut out: Vec<LoopSummary> = self
            .loops
            .iter()
            .map(|entry| LoopSummary::from(entry.value()))
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}
