//! Instance-deduplication cache.
//!
//! Composition produces one prim index per occurrence of a scene object.
//! Indexes declared instanceable and composing identically (same
//! [`InstanceKey`]) share a single canonical subtree, the *master*, instead
//! of being composed per occurrence. This cache assigns instances to
//! masters, batches registration churn, and answers the path queries needed
//! to navigate between the instanced scene and master subtrees.
//!
//! # Lifecycle of a batch
//! 1. Composition threads call [`InstanceCache::register_instance_prim_index`]
//!    and [`InstanceCache::unregister_instance_prim_indexes_under`]; both
//!    only stage work in pending buffers behind a short-held lock.
//! 2. The host quiesces composition and calls
//!    [`InstanceCache::process_changes`], which reconciles the staged work in
//!    three steps (remove, add, drop-empties) and reports created, retargeted,
//!    and released masters in an [`InstanceChanges`] record.
//! 3. Queries read the reconciled maps; they never see pending work.
//!
//! # Invariants (outside `process_changes`)
//! - `key_to_master` / `master_to_key` are mutual inverses.
//! - `master_to_indexes[m]` is nonempty, strictly sorted, and holds exactly
//!   the paths that `index_to_master` maps to `m`.
//! - Every master has exactly one source prim index, drawn from its
//!   instance set; `source_index_to_master` / `master_to_source_index` are
//!   mutual inverses.
//! - Entries of `index_to_master` nest only beneath a master's source index
//!   (only source subtrees are composed, so only they can contain nested
//!   instance indexes).
//! - Master paths are never reused, even after release.
//! - Pending buffers are empty.
//!
//! # Concurrency
//! Registration takes `&self` and may run from many threads; the pending
//! buffers are the only state it mutates, under [`parking_lot::Mutex`].
//! `process_changes` takes `&mut self`, so the host's obligation to
//! serialize flushes and queries against registration is enforced by the
//! borrow checker for safe callers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::changes::InstanceChanges;
use crate::config;
use crate::key::{InstanceKey, PrimIndex};
use crate::path::ScenePath;
use crate::verify::verify;

/// Name prefix shared by every master root prim.
pub const MASTER_PATH_PREFIX: &str = "__Master_";

/// Registration work staged between change-processing passes.
#[derive(Default)]
struct Pending {
    added: AHashMap<InstanceKey, Vec<ScenePath>>,
    removed: AHashMap<InstanceKey, Vec<ScenePath>>,
}

/// Cache assigning instanceable prim indexes to shared masters.
///
/// See the [module docs](self) for the batch lifecycle and invariants.
#[derive(Default)]
pub struct InstanceCache {
    /// Current master for each instancing key.
    key_to_master: AHashMap<InstanceKey, ScenePath>,
    /// Inverse of `key_to_master`.
    master_to_key: AHashMap<ScenePath, InstanceKey>,
    /// Every registered instance prim index, mapped to its master. Ordered
    /// so unregister-under and nearest-ancestor lookups can range-scan.
    index_to_master: BTreeMap<ScenePath, ScenePath>,
    /// Sorted, deduplicated instance set per master.
    master_to_indexes: AHashMap<ScenePath, Vec<ScenePath>>,
    /// The one prim index composed to realize each master.
    source_index_to_master: AHashMap<ScenePath, ScenePath>,
    /// Inverse of `source_index_to_master`.
    master_to_source_index: AHashMap<ScenePath, ScenePath>,
    /// Staged registrations and unregistrations.
    pending: Mutex<Pending>,
    /// Monotonic master-name counter; never rewound on release.
    last_master_index: u64,
    /// Test override for the deterministic-assignment env flag.
    deterministic_masters: Option<bool>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces deterministic master assignment on or off, bypassing the
    /// `INSTANCE_CACHE_DETERMINISTIC_MASTERS` environment lookup. `None`
    /// restores the environment-driven behavior.
    pub fn set_deterministic_master_assignment(&mut self, flag: Option<bool>) {
        self.deterministic_masters = flag;
    }

    /// Stages an instanceable prim index for assignment to a master.
    ///
    /// Returns `true` iff the caller must compose this index: no master
    /// exists for its key and this is the first registration for that key
    /// in the current batch, so this index will become the new master's
    /// source. Callers receiving `true` must not cull the index.
    ///
    /// Safe to call concurrently with other registrations. Returns `false`
    /// without staging anything if the index is not instanceable.
    pub fn register_instance_prim_index(&self, index: &impl PrimIndex) -> bool {
        if !verify!(
            index.is_instanceable(),
            "rejecting non-instanceable prim index {}",
            index.path()
        ) {
            return false;
        }

        // Compute the key before taking the lock; hashing the composition
        // structure is the expensive part of registration.
        let key = InstanceKey::of(index);

        // `key_to_master` is only mutated under `&mut self`, which cannot
        // overlap registration, so this unlocked read is sound.
        let master_already_exists = self.key_to_master.contains_key(&key);

        let mut pending = self.pending.lock();
        let pending_for_key = pending.added.entry(key).or_default();
        pending_for_key.push(index.path().clone());

        !master_already_exists && pending_for_key.len() == 1
    }

    /// Stages removal of every registered instance prim index at or under
    /// `prefix`.
    ///
    /// Only indexes already reconciled into the cache are visible here;
    /// same-batch registrations that have not been flushed are reconciled
    /// against removals inside [`Self::process_changes`].
    pub fn unregister_instance_prim_indexes_under(&self, prefix: &ScenePath) {
        let mut pending = self.pending.lock();
        for (index_path, master_path) in self.index_to_master.range(prefix..) {
            if !index_path.has_prefix(prefix) {
                break;
            }
            let key = match self.master_to_key.get(master_path) {
                Some(key) => *key,
                None => {
                    verify!(false, "master {master_path} missing from master_to_key");
                    continue;
                }
            };
            pending.removed.entry(key).or_default().push(index_path.clone());
        }
    }

    /// Drains the pending buffers and reconciles the cache, appending the
    /// resulting master churn to `changes`.
    ///
    /// Removals are applied first, then additions (so a key emptied and
    /// refilled in the same batch keeps its master), and finally masters
    /// left without instances are released. Master release order and, with
    /// deterministic assignment off, master creation order follow hash-map
    /// iteration order; enable the flag for repeatable assignment.
    pub fn process_changes(&mut self, changes: &mut InstanceChanges) {
        let deterministic =
            config::deterministic_master_assignment(self.deterministic_masters);
        let mut pending = mem::take(self.pending.get_mut());

        // Remove unregistered prim indexes, ignoring any that were
        // re-registered in the same batch.
        for (key, removed) in pending.removed.iter_mut() {
            if let Some(added) = pending.added.get(key) {
                let mut added = added.clone();
                added.sort_unstable();
                removed.sort_unstable();
                *removed = sorted_set_difference(removed, &added);
            }
            self.remove_instances(key, removed, changes);
        }

        // Add newly-registered prim indexes.
        if deterministic {
            // Master names depend on the order keys are processed in.
            // Iterating the pending map directly would leak hash-map order
            // into the assignment, so order keys by their least added path,
            // which is stable because prim index paths are globally unique.
            let mut keys_by_min_path = BTreeMap::new();
            for (key, added) in &pending.added {
                let min_path = match added.iter().min() {
                    Some(min_path) => min_path,
                    None => {
                        verify!(false, "empty pending addition list for {key:?}");
                        continue;
                    }
                };
                keys_by_min_path.insert(min_path.clone(), *key);
            }
            for key in keys_by_min_path.values() {
                if let Some(added) = pending.added.get_mut(key) {
                    self.create_or_update_master(key, added, changes);
                }
            }
        } else {
            for (key, added) in pending.added.iter_mut() {
                self.create_or_update_master(key, added, changes);
            }
        }

        // With additions and removals both applied, release masters whose
        // instance set stayed empty.
        for key in pending.removed.keys() {
            self.remove_master_if_no_instances(key, changes);
        }
    }

    /// Removes `removed` instances from `key`'s master, retargeting the
    /// master's source if the current source is among them.
    fn remove_instances(
        &mut self,
        key: &InstanceKey,
        removed: &[ScenePath],
        changes: &mut InstanceChanges,
    ) {
        let master_path = match self.key_to_master.get(key) {
            Some(master_path) => master_path.clone(),
            None => return,
        };
        let mut master_needs_new_source = false;

        let indexes_for_master =
            self.master_to_indexes.entry(master_path.clone()).or_default();
        for path in removed {
            if let Ok(pos) = indexes_for_master.binary_search(path) {
                indexes_for_master.remove(pos);
                self.index_to_master.remove(path);
            }
            if self.source_index_to_master.remove(path).is_some() {
                verify!(
                    self.master_to_source_index.remove(&master_path).is_some(),
                    "source maps out of sync for {master_path}"
                );
                master_needs_new_source = true;
            }
        }

        // If the source is gone but other instances remain, promote the
        // least remaining path. An emptied master is NOT released here; a
        // registration later in this batch may refill it, and release is
        // deferred to remove_master_if_no_instances.
        if master_needs_new_source && !indexes_for_master.is_empty() {
            let new_source = indexes_for_master[0].clone();
            debug!(master = %master_path, source = %new_source, "assigning new source prim index");
            self.source_index_to_master
                .insert(new_source.clone(), master_path.clone());
            self.master_to_source_index
                .insert(master_path.clone(), new_source.clone());
            changes.changed_master_prims.push(master_path);
            changes.changed_master_prim_indexes.push(new_source);
        }
    }

    /// Assigns `added` instances to `key`'s master, creating the master if
    /// the key has none.
    fn create_or_update_master(
        &mut self,
        key: &InstanceKey,
        added: &mut Vec<ScenePath>,
        changes: &mut InstanceChanges,
    ) {
        if !verify!(!added.is_empty(), "empty pending addition list for {key:?}") {
            return;
        }

        let master_path = match self.key_to_master.get(key).cloned() {
            Some(master_path) => {
                // The master survived this batch's removals. If it lost its
                // source in the remove step (last instance unregistered,
                // new one registered in the same batch), retarget it now.
                if !self.master_to_source_index.contains_key(&master_path) {
                    let source = added[0].clone();
                    debug!(master = %master_path, source = %source, "assigning new source prim index");
                    self.source_index_to_master
                        .insert(source.clone(), master_path.clone());
                    self.master_to_source_index
                        .insert(master_path.clone(), source.clone());
                    changes.changed_master_prims.push(master_path.clone());
                    changes.changed_master_prim_indexes.push(source);
                }
                master_path
            }
            None => {
                // The first index registered for the key becomes the
                // source: its caller was told to compose it via the `true`
                // return from register_instance_prim_index.
                let master_path = self.next_master_path();
                let source = added[0].clone();
                debug!(master = %master_path, source = %source, "creating master");
                self.key_to_master.insert(*key, master_path.clone());
                self.master_to_key.insert(master_path.clone(), *key);
                self.source_index_to_master
                    .insert(source.clone(), master_path.clone());
                self.master_to_source_index
                    .insert(master_path.clone(), source.clone());
                changes.new_master_prims.push(master_path.clone());
                changes.new_master_prim_indexes.push(source);
                master_path
            }
        };

        for path in added.iter() {
            self.index_to_master.insert(path.clone(), master_path.clone());
        }

        added.sort_unstable();
        added.dedup();
        let indexes_for_master =
            self.master_to_indexes.entry(master_path).or_default();
        if indexes_for_master.is_empty() {
            mem::swap(indexes_for_master, added);
        } else {
            merge_sorted_paths(indexes_for_master, added);
        }
    }

    /// Releases `key`'s master if the batch left it without instances.
    fn remove_master_if_no_instances(
        &mut self,
        key: &InstanceKey,
        changes: &mut InstanceChanges,
    ) {
        // Copy the master path out before touching either map; every map
        // entry naming it is about to be erased.
        let master_path = match self.key_to_master.get(key) {
            Some(master_path) => master_path.clone(),
            None => return,
        };
        let indexes_for_master = match self.master_to_indexes.get(&master_path) {
            Some(indexes) => indexes,
            None => {
                verify!(false, "master {master_path} missing its instance list");
                return;
            }
        };
        if !indexes_for_master.is_empty() {
            return;
        }

        debug!(master = %master_path, "releasing master");
        changes.dead_master_prims.push(master_path.clone());
        self.master_to_key.remove(&master_path);
        self.key_to_master.remove(key);
        self.master_to_indexes.remove(&master_path);
    }

    /// Allocates the next master path. The counter is pre-incremented and
    /// never rewound, so released paths are never reissued.
    fn next_master_path(&mut self) -> ScenePath {
        self.last_master_index += 1;
        ScenePath::absolute_root()
            .append_child(&format!("{MASTER_PATH_PREFIX}{}", self.last_master_index))
    }

    /// All current master paths, in unspecified order.
    pub fn all_masters(&self) -> Vec<ScenePath> {
        self.key_to_master.values().cloned().collect()
    }

    /// Number of current masters.
    pub fn num_masters(&self) -> usize {
        self.master_to_key.len()
    }

    /// The master realized by composing the prim index at `prim_index_path`,
    /// if that path is some master's source.
    pub fn master_using_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> Option<ScenePath> {
        self.source_index_to_master.get(prim_index_path).cloned()
    }

    /// The master the instance prim index at `prim_index_path` is assigned
    /// to, if that exact path is registered.
    pub fn master_for_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> Option<ScenePath> {
        self.index_to_master.get(prim_index_path).cloned()
    }

    /// True iff some strict ancestor of `prim_index_path` is a registered
    /// instance, i.e. the path is inside an instance's subtree.
    pub fn is_prim_in_master_for_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> bool {
        find_entry_for_ancestor(&self.index_to_master, prim_index_path).is_some()
    }

    /// Translates a prim index path inside an instance subtree to the
    /// corresponding path in a master.
    ///
    /// Nested instancing makes this iterative: `prim_index_path` may never
    /// have been composed because its enclosing instance shares a master
    /// with a sibling. Each round either lands in the enclosing master (the
    /// nearest enclosing instance is that master's source) or rewrites the
    /// path onto the source's subtree, which *was* composed, and retries.
    /// Every rewrite removes one non-source enclosing instance, so the loop
    /// terminates.
    pub fn prim_in_master_for_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> Option<ScenePath> {
        let mut cur = prim_index_path.clone();
        loop {
            let (instance_path, master_path) =
                find_entry_for_ancestor(&self.index_to_master, &cur)?;
            let source_path = match self.master_to_source_index.get(master_path) {
                Some(source_path) => source_path,
                None => {
                    verify!(false, "master {master_path} has no source prim index");
                    return None;
                }
            };
            if instance_path == source_path {
                return Some(cur.replace_prefix(instance_path, master_path));
            }
            cur = cur.replace_prefix(instance_path, source_path);
        }
    }

    /// True iff the prim index at `prim_index_path` is used by at least one
    /// prim in a master.
    pub fn is_prim_in_master_using_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> bool {
        self.walk_masters_using_prim_index(prim_index_path, None)
    }

    /// All master prims whose subtrees use the prim index at
    /// `prim_index_path`. Nested instancing means there can be zero, one,
    /// or several.
    pub fn prims_in_masters_using_prim_index_at_path(
        &self,
        prim_index_path: &ScenePath,
    ) -> Vec<ScenePath> {
        let mut master_prim_paths = Vec::new();
        self.walk_masters_using_prim_index(prim_index_path, Some(&mut master_prim_paths));
        master_prim_paths
    }

    /// Shared walk behind the used-by-master queries.
    ///
    /// A lookup through `source_index_to_master` alone would falsely match
    /// sibling-instance paths that were never composed (only source
    /// subtrees are), so this walks `index_to_master` instead: record a use
    /// whenever the current path lies under the enclosing master's source,
    /// then step outward past the enclosing instance to find outer masters
    /// that may also project the path (nested instancing). A strict-ancestor
    /// match ends the walk: descendants of an instanceable index belong to
    /// exactly one master.
    fn walk_masters_using_prim_index(
        &self,
        prim_index_path: &ScenePath,
        mut collect: Option<&mut Vec<ScenePath>>,
    ) -> bool {
        let mut used_by_master = false;

        let mut cur = prim_index_path.clone();
        while !cur.is_absolute_root() {
            let (instance_path, master_path) =
                match find_entry_for_path_or_ancestor(&self.index_to_master, &cur) {
                    Some(entry) => entry,
                    None => break,
                };
            let source_path = match self.master_to_source_index.get(master_path) {
                Some(source_path) => source_path,
                None => {
                    verify!(false, "master {master_path} has no source prim index");
                    break;
                }
            };

            if cur.has_prefix(source_path) {
                used_by_master = true;
                match collect.as_deref_mut() {
                    Some(out) => out
                        .push(prim_index_path.replace_prefix(source_path, master_path)),
                    None => break,
                }
            }

            if *instance_path != cur {
                break;
            }
            match instance_path.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        used_by_master
    }

    /// True iff `path` is a master prim path or lies inside a master
    /// subtree, judged purely by the root prim's name.
    pub fn is_path_master_or_in_master(path: &ScenePath) -> bool {
        if path.is_absolute_root() {
            return false;
        }
        let mut root_prim = path.clone();
        while !root_prim.is_root_prim_path() {
            match root_prim.parent() {
                Some(parent) => root_prim = parent,
                None => return false,
            }
        }
        root_prim.name().starts_with(MASTER_PATH_PREFIX)
    }

    /// Walks every cache invariant through the verification hook, logging
    /// each violation. Returns `true` when the maps are consistent.
    ///
    /// Diagnostic aid; the test suites run it after every
    /// [`Self::process_changes`] pass.
    pub fn check_invariants(&self) -> bool {
        let mut ok = true;

        // key_to_master and master_to_key are mutual inverses.
        ok &= verify!(
            self.key_to_master.len() == self.master_to_key.len(),
            "key and master map sizes differ"
        );
        for (key, master_path) in &self.key_to_master {
            ok &= verify!(
                self.master_to_key.get(master_path) == Some(key),
                "master {master_path} does not map back to its key"
            );
        }

        // Each master's instance set is nonempty, strictly sorted, and
        // matches index_to_master exactly.
        ok &= verify!(
            self.master_to_indexes.len() == self.master_to_key.len(),
            "instance-list count does not match master count"
        );
        let mut total_instances = 0;
        for (master_path, indexes) in &self.master_to_indexes {
            total_instances += indexes.len();
            ok &= verify!(
                !indexes.is_empty(),
                "master {master_path} has an empty instance set"
            );
            ok &= verify!(
                indexes.windows(2).all(|pair| pair[0] < pair[1]),
                "instance set for {master_path} is not strictly sorted"
            );
            for path in indexes {
                ok &= verify!(
                    self.index_to_master.get(path) == Some(master_path),
                    "instance {path} is not mapped to {master_path}"
                );
            }
        }
        ok &= verify!(
            total_instances == self.index_to_master.len(),
            "index_to_master holds paths outside every master's instance set"
        );

        // Every master has exactly one source, drawn from its instances.
        ok &= verify!(
            self.master_to_source_index.len() == self.master_to_key.len(),
            "source count does not match master count"
        );
        ok &= verify!(
            self.source_index_to_master.len() == self.master_to_source_index.len(),
            "source maps have different sizes"
        );
        for (master_path, source_path) in &self.master_to_source_index {
            ok &= verify!(
                self.source_index_to_master.get(source_path) == Some(master_path),
                "source {source_path} does not map back to {master_path}"
            );
            let in_instance_set = self
                .master_to_indexes
                .get(master_path)
                .is_some_and(|indexes| indexes.binary_search(source_path).is_ok());
            ok &= verify!(
                in_instance_set,
                "source {source_path} is not an instance of {master_path}"
            );
        }

        // Nested entries are only composed under source subtrees.
        for path in self.index_to_master.keys() {
            if let Some((ancestor_path, ancestor_master)) =
                find_entry_for_ancestor(&self.index_to_master, path)
            {
                ok &= verify!(
                    self.master_to_source_index.get(ancestor_master)
                        == Some(ancestor_path),
                    "instance {path} nests under {ancestor_path}, which is not its master's source"
                );
            }
        }

        ok
    }
}

/// Nearest entry whose key is `path` or one of its ancestors, preferring
/// the deepest match.
fn find_entry_for_path_or_ancestor<'m>(
    map: &'m BTreeMap<ScenePath, ScenePath>,
    path: &ScenePath,
) -> Option<(&'m ScenePath, &'m ScenePath)> {
    let mut cur = path.clone();
    while !cur.is_absolute_root() {
        // Last entry ordered at or before `cur`: the only candidate that
        // can be a prefix of it, given component-wise ordering.
        if let Some((entry_path, master_path)) = map.range(..=&cur).next_back() {
            if cur.has_prefix(entry_path) {
                return Some((entry_path, master_path));
            }
        }
        cur = cur.parent()?;
    }
    None
}

/// Nearest entry whose key is a *strict* ancestor of `path`.
fn find_entry_for_ancestor<'m>(
    map: &'m BTreeMap<ScenePath, ScenePath>,
    path: &ScenePath,
) -> Option<(&'m ScenePath, &'m ScenePath)> {
    find_entry_for_path_or_ancestor(map, &path.parent()?)
}

/// `a - b` over sorted path slices, mirroring set semantics: one matching
/// element of `b` cancels one element of `a`.
fn sorted_set_difference(a: &[ScenePath], b: &[ScenePath]) -> Vec<ScenePath> {
    let mut difference = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                difference.push(a[i].clone());
                i += 1;
            }
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    difference.extend_from_slice(&a[i..]);
    difference
}

/// Merges sorted, deduplicated `src` into sorted, deduplicated `dst`,
/// preserving both properties. Linear in the combined length.
fn merge_sorted_paths(dst: &mut Vec<ScenePath>, src: &[ScenePath]) {
    let old = mem::take(dst);
    dst.reserve(old.len() + src.len());
    let mut a = old.into_iter();
    let mut b = src.iter();
    let mut next_a = a.next();
    let mut next_b = b.next();
    loop {
        match (next_a.take(), next_b.take()) {
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Less => {
                    dst.push(x);
                    next_a = a.next();
                    next_b = Some(y);
                }
                Ordering::Greater => {
                    dst.push(y.clone());
                    next_a = Some(x);
                    next_b = b.next();
                }
                Ordering::Equal => {
                    dst.push(x);
                    next_a = a.next();
                    next_b = b.next();
                }
            },
            (Some(x), None) => {
                dst.push(x);
                dst.extend(a);
                break;
            }
            (None, Some(y)) => {
                dst.push(y.clone());
                dst.extend(b.cloned());
                break;
            }
            (None, None) => break,
        }
    }
}
