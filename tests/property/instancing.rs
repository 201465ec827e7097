//! Model-based property tests for instancing reconciliation.
//!
//! Random interleavings of register/unregister calls, flushed in batches,
//! are replayed against a naive model of the commit semantics. After every
//! flush the cache must agree with the model and its internal invariants
//! must hold.
//!
//! # Invariants
//! - Key/master, instance, and source maps stay mutually consistent
//!   (`check_invariants`).
//! - A key keeps its master for as long as it continuously has instances,
//!   including batches that empty and refill it.
//! - Released master paths are never issued again.
//! - With deterministic assignment enabled, registration arrival order
//!   does not affect master assignment.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use instance_cache::{InstanceCache, InstanceChanges, PrimIndex, ScenePath};

/// Universe of prim paths the generator draws from. Each path always
/// registers under the same key, the way one scene object recomposes to the
/// same content across resyncs.
const NUM_PRIMS: usize = 12;
/// Distinct instancing keys across the universe.
const NUM_KEYS: usize = 4;

struct TestPrimIndex {
    path: ScenePath,
    key_tag: u64,
}

impl PrimIndex for TestPrimIndex {
    fn path(&self) -> &ScenePath {
        &self.path
    }

    fn is_instanceable(&self) -> bool {
        true
    }

    fn hash_instancing_structure(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.key_tag.to_le_bytes());
    }
}

fn prim_path(prim: usize) -> ScenePath {
    ScenePath::new(format!("/World/Prim_{prim:02}"))
}

fn key_of(prim: usize) -> usize {
    prim % NUM_KEYS
}

fn prim_index(prim: usize) -> TestPrimIndex {
    TestPrimIndex {
        path: prim_path(prim),
        key_tag: key_of(prim) as u64,
    }
}

#[derive(Clone, Debug)]
enum Op {
    Register(usize),
    Unregister(usize),
    UnregisterAll,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..NUM_PRIMS).prop_map(Op::Register),
        3 => (0..NUM_PRIMS).prop_map(Op::Unregister),
        1 => Just(Op::UnregisterAll),
    ]
}

/// Naive model of the batch commit semantics: unregistration only sees
/// committed prims, and a prim both unregistered and re-registered in one
/// batch stays committed.
#[derive(Default)]
struct Model {
    committed: BTreeSet<usize>,
    batch_added: BTreeSet<usize>,
    batch_removed: BTreeSet<usize>,
}

impl Model {
    fn register(&mut self, prim: usize) {
        self.batch_added.insert(prim);
    }

    fn unregister(&mut self, prim: usize) {
        if self.committed.contains(&prim) {
            self.batch_removed.insert(prim);
        }
    }

    fn unregister_all(&mut self) {
        self.batch_removed.extend(self.committed.iter().copied());
    }

    fn flush(&mut self) {
        for prim in &self.batch_removed {
            if !self.batch_added.contains(prim) {
                self.committed.remove(prim);
            }
        }
        self.committed.extend(self.batch_added.iter().copied());
        self.batch_added.clear();
        self.batch_removed.clear();
    }

    fn live_keys(&self) -> BTreeSet<usize> {
        self.committed.iter().map(|&prim| key_of(prim)).collect()
    }

    /// Whether a register call for `prim` must return `true`: its key has
    /// no master and no earlier registration in the current batch.
    fn expects_new_master(&self, prim: usize, live_masters: &BTreeMap<usize, ScenePath>) -> bool {
        let key = key_of(prim);
        !live_masters.contains_key(&key)
            && !self.batch_added.iter().any(|&p| key_of(p) == key)
    }
}

fn check_against_model(
    cache: &InstanceCache,
    model: &Model,
    changes: &InstanceChanges,
    live_masters: &mut BTreeMap<usize, ScenePath>,
    ever_issued: &mut BTreeSet<ScenePath>,
) -> Result<(), TestCaseError> {
    prop_assert!(cache.check_invariants());

    let keys_before: BTreeSet<usize> = live_masters.keys().copied().collect();
    let keys_after = model.live_keys();
    prop_assert_eq!(cache.num_masters(), keys_after.len());

    // Committed prims resolve to exactly one master per key; uncommitted
    // prims resolve to nothing.
    let mut masters_after = BTreeMap::new();
    for prim in 0..NUM_PRIMS {
        let looked_up = cache.master_for_prim_index_at_path(&prim_path(prim));
        if model.committed.contains(&prim) {
            let master = match looked_up {
                Some(master) => master,
                None => return Err(TestCaseError::fail(format!("prim {prim} lost its master"))),
            };
            prop_assert!(master.name().starts_with(instance_cache::MASTER_PATH_PREFIX));
            if let Some(previous) = masters_after.insert(key_of(prim), master.clone()) {
                prop_assert_eq!(previous, master, "one key split across two masters");
            }
        } else {
            prop_assert_eq!(looked_up, None, "unregistered prim {} still mapped", prim);
        }
    }
    let distinct: BTreeSet<_> = masters_after.values().collect();
    prop_assert_eq!(distinct.len(), masters_after.len(), "two keys share a master");

    // Keys alive across the flush keep their master, even through a batch
    // that emptied and refilled them.
    for key in keys_before.intersection(&keys_after) {
        prop_assert_eq!(live_masters.get(key), masters_after.get(key));
    }

    // Keys that died this flush are reported dead exactly once, and their
    // paths leave the live set for good.
    for key in keys_before.difference(&keys_after) {
        let dead = &live_masters[key];
        prop_assert_eq!(
            changes.dead_master_prims.iter().filter(|m| *m == dead).count(),
            1
        );
    }
    let live_now: BTreeSet<_> = cache.all_masters().into_iter().collect();
    for dead in &changes.dead_master_prims {
        prop_assert!(!live_now.contains(dead));
    }

    // Keys born this flush get masters that were never issued before.
    for key in keys_after.difference(&keys_before) {
        let master = &masters_after[key];
        prop_assert!(
            changes.new_master_prims.contains(master),
            "key {} gained master {} without a new-master record",
            key,
            master
        );
        prop_assert!(!ever_issued.contains(master), "master path reused");
    }
    prop_assert_eq!(
        changes.new_master_prims.len(),
        changes.new_master_prim_indexes.len()
    );
    prop_assert_eq!(
        changes.changed_master_prims.len(),
        changes.changed_master_prim_indexes.len()
    );

    // Each new master's reported source index realizes it.
    for (master, source) in changes
        .new_master_prims
        .iter()
        .zip(&changes.new_master_prim_indexes)
    {
        let found = cache.master_using_prim_index_at_path(source);
        prop_assert_eq!(found.as_ref(), Some(master));
    }

    // Exactly one committed prim per live key serves as the source.
    let mut sources_seen = 0;
    for &prim in &model.committed {
        if let Some(master) = cache.master_using_prim_index_at_path(&prim_path(prim)) {
            sources_seen += 1;
            prop_assert_eq!(Some(master), masters_after.get(&key_of(prim)).cloned());
        }
    }
    prop_assert_eq!(sources_seen, keys_after.len());

    ever_issued.extend(masters_after.values().cloned());
    *live_masters = masters_after;
    Ok(())
}

proptest! {
    /// Random batches against the naive model, checking every cache
    /// invariant and the change record after each flush.
    #[test]
    fn batched_changes_match_model(
        batches in prop::collection::vec(
            prop::collection::vec(op_strategy(), 0..10),
            1..8,
        )
    ) {
        let mut cache = InstanceCache::new();
        let mut model = Model::default();
        let mut live_masters = BTreeMap::new();
        let mut ever_issued = BTreeSet::new();

        for batch in batches {
            for op in batch {
                match op {
                    Op::Register(prim) => {
                        let expected = model.expects_new_master(prim, &live_masters);
                        let got = cache.register_instance_prim_index(&prim_index(prim));
                        prop_assert_eq!(got, expected, "register contract for prim {}", prim);
                        model.register(prim);
                    }
                    Op::Unregister(prim) => {
                        cache.unregister_instance_prim_indexes_under(&prim_path(prim));
                        model.unregister(prim);
                    }
                    Op::UnregisterAll => {
                        cache.unregister_instance_prim_indexes_under(&ScenePath::new("/World"));
                        model.unregister_all();
                    }
                }
            }

            let mut changes = InstanceChanges::default();
            cache.process_changes(&mut changes);
            model.flush();
            check_against_model(&cache, &model, &changes, &mut live_masters, &mut ever_issued)?;
        }
    }

    /// With deterministic assignment on, the same registrations produce the
    /// same master paths regardless of arrival order.
    #[test]
    fn deterministic_assignment_ignores_arrival_order(
        (ordered, shuffled) in prop::collection::btree_set(0..NUM_PRIMS, 1..NUM_PRIMS)
            .prop_flat_map(|prims| {
                let ordered: Vec<usize> = prims.into_iter().collect();
                (Just(ordered.clone()), Just(ordered).prop_shuffle())
            })
    ) {
        let mut first = InstanceCache::new();
        first.set_deterministic_master_assignment(Some(true));
        let mut second = InstanceCache::new();
        second.set_deterministic_master_assignment(Some(true));

        for &prim in &ordered {
            first.register_instance_prim_index(&prim_index(prim));
        }
        for &prim in &shuffled {
            second.register_instance_prim_index(&prim_index(prim));
        }

        let mut changes = InstanceChanges::default();
        first.process_changes(&mut changes);
        let mut changes = InstanceChanges::default();
        second.process_changes(&mut changes);

        prop_assert!(first.check_invariants());
        prop_assert!(second.check_invariants());

        for &prim in &ordered {
            prop_assert_eq!(
                first.master_for_prim_index_at_path(&prim_path(prim)),
                second.master_for_prim_index_at_path(&prim_path(prim)),
                "prim {} assigned differently across arrival orders",
                prim
            );
        }

        let mut first_masters = first.all_masters();
        let mut second_masters = second.all_masters();
        first_masters.sort();
        second_masters.sort();
        prop_assert_eq!(first_masters, second_masters);
    }
}
