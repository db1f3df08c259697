//! Reconciliation plan: the pure output of `sync::reconciler::plan`.

use serde::Serialize;

use super::asset::DirectoryAsset;
use super::instance::NormalizedInstance;

/// A matched pair whose directory record has drifted from the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpdate {
    pub asset: DirectoryAsset,
    pub instance: NormalizedInstance,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDelete {
    pub asset: DirectoryAsset,
    pub reason: String,
}

/// `to_create`, `to_update` and `to_delete` are disjoint: no instance or
/// asset appears in more than one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    pub to_create: Vec<NormalizedInstance>,
    pub to_update: Vec<PlannedUpdate>,
    pub to_delete: Vec<PlannedDelete>,
    pub skipped: usize,
    pub protected: usize,
    pub excluded: usize,
}

impl ReconciliationPlan {
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn mutation_count(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }
}
