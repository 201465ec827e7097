//! Change record emitted by one batch of instancing reconciliation.

use crate::path::ScenePath;

/// Masters created, retargeted, and released by one
/// [`process_changes`](crate::InstanceCache::process_changes) pass.
///
/// The record is owned by the caller; `process_changes` appends to it
/// without clearing, so one record can accumulate several passes.
///
/// # Invariants
/// - `new_master_prims[i]` is realized by composing
///   `new_master_prim_indexes[i]`; the vectors are parallel.
/// - `changed_master_prims[i]` was retargeted to source
///   `changed_master_prim_indexes[i]`; the vectors are parallel.
/// - `dead_master_prims` paths are never reused by later passes.
#[derive(Clone, Debug, Default)]
pub struct InstanceChanges {
    /// Masters created this pass.
    pub new_master_prims: Vec<ScenePath>,
    /// Source prim index realizing each new master.
    pub new_master_prim_indexes: Vec<ScenePath>,
    /// Masters whose source prim index was reassigned this pass.
    pub changed_master_prims: Vec<ScenePath>,
    /// The new source prim index for each changed master.
    pub changed_master_prim_indexes: Vec<ScenePath>,
    /// Masters released this pass.
    pub dead_master_prims: Vec<ScenePath>,
}

impl InstanceChanges {
    /// True when the pass produced no master churn at all.
    pub fn is_empty(&self) -> bool {
        self.new_master_prims.is_empty()
            && self.changed_master_prims.is_empty()
            && self.dead_master_prims.is_empty()
    }

    /// Drops all recorded changes, keeping allocations.
    pub fn clear(&mut self) {
        self.new_master_prims.clear();
        self.new_master_prim_indexes.clear();
        self.changed_master_prims.clear();
        self.changed_master_prim_indexes.clear();
        self.dead_master_prims.clear();
    }
}
