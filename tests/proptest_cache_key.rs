//! Property-based tests for cache keys and collection diffs.
//!
//! # Properties Tested
//!
//! 1. **Order Independence**: parameter insertion order never changes the key
//! 2. **Set Normalization**: permuted and duplicated set values give one key
//! 3. **Injectivity**: distinct parameter values give distinct keys
//! 4. **Diff Consistency**: a diff accounts for every record of both sequences

use proptest::prelude::*;
use quickcheck::{quickcheck, TestResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use sync_kit::{cache_key, CollectionDiff, KeyParams, Resource};

// ============================================================================
// Strategies
// ============================================================================

fn param_name() -> impl Strategy<Value = String> {
    "[a-z_]{1,12}"
}

fn param_value() -> impl Strategy<Value = String> {
    // Includes the key's reserved characters.
    "[a-zA-Z0-9 &=?:,%]{0,16}"
}

fn params() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(param_name(), param_value(), 0..8)
}

fn build(pairs: &[(String, String)]) -> KeyParams {
    pairs
        .iter()
        .fold(KeyParams::new(), |params, (name, value)| params.with(name.clone(), value.clone()))
}

// ============================================================================
// Cache Key Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_key_ignores_parameter_order(
        pairs in params(),
        seed in any::<u64>(),
    ) {
        let forward: Vec<(String, String)> = pairs.into_iter().collect();
        let mut shuffled = forward.clone();
        // Deterministic permutation from the seed
        let len = shuffled.len().max(1);
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let a = cache_key("assignment", Some("course_1"), &build(&forward));
        let b = cache_key("assignment", Some("course_1"), &build(&shuffled));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_set_values_are_normalized(
        values in prop::collection::vec("[a-z]{1,8}", 1..6),
    ) {
        let mut reordered = values.clone();
        reordered.reverse();
        reordered.extend(values.iter().cloned());

        let a = cache_key("assignment", None, &KeyParams::new().with_set("include", values));
        let b = cache_key("assignment", None, &KeyParams::new().with_set("include", reordered));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_distinct_values_give_distinct_keys(
        name in param_name(),
        a in param_value(),
        b in param_value(),
    ) {
        prop_assume!(a != b);
        let key_a = cache_key("assignment", Some("course_1"), &KeyParams::new().with(name.clone(), a));
        let key_b = cache_key("assignment", Some("course_1"), &KeyParams::new().with(name, b));
        prop_assert_ne!(key_a, key_b);
    }

    #[test]
    fn prop_context_is_part_of_identity(
        first in "[a-z0-9:?]{1,10}",
        second in "[a-z0-9:?]{1,10}",
    ) {
        prop_assume!(first != second);
        let params = KeyParams::new().with("grading_period_id", "1");
        prop_assert_ne!(
            cache_key("assignment", Some(&first), &params),
            cache_key("assignment", Some(&second), &params)
        );
    }

    #[test]
    fn prop_resource_type_is_recoverable(context in "[a-z0-9_]{0,10}", pairs in params()) {
        let forward: Vec<(String, String)> = pairs.into_iter().collect();
        let context = Some(context.as_str()).filter(|c| !c.is_empty());
        let key = cache_key("module_item", context, &build(&forward));
        prop_assert_eq!(key.resource_type(), "module_item");
    }
}

// ============================================================================
// Collection Diff Properties
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Row {
    id: u8,
    value: u8,
}

impl Resource for Row {
    type Id = u8;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn resource_type() -> &'static str {
        "row"
    }
}

fn rows(raw: Vec<(u8, u8)>) -> Vec<Row> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|(id, _)| seen.insert(*id))
        .map(|(id, value)| Row { id, value })
        .collect()
}

fn diff_accounts_for_every_record(old: Vec<(u8, u8)>, new: Vec<(u8, u8)>) -> TestResult {
    let old = rows(old);
    let new = rows(new);
    let diff = CollectionDiff::between(&old, &new);

    let old_ids: HashSet<u8> = old.iter().map(|r| r.id).collect();
    let new_ids: HashSet<u8> = new.iter().map(|r| r.id).collect();

    // Counts add up
    if old.len() - diff.removed.len() + diff.inserted.len() != new.len() {
        return TestResult::failed();
    }
    // Removed records are exactly the ones that left
    if !diff.removed.iter().all(|&i| !new_ids.contains(&old[i].id)) {
        return TestResult::failed();
    }
    if !diff.inserted.iter().all(|&i| !old_ids.contains(&new[i].id)) {
        return TestResult::failed();
    }
    // Updated records survived with different content
    let updated_ok = diff.updated.iter().all(|&i| {
        old.iter()
            .find(|r| r.id == new[i].id)
            .is_some_and(|before| before != &new[i])
    });
    if !updated_ok {
        return TestResult::failed();
    }
    // Moves pair up the same record
    if !diff.moved.iter().all(|&(o, n)| old[o].id == new[n].id) {
        return TestResult::failed();
    }
    TestResult::from_bool(diff.is_empty() == (old == new))
}

fn unmoved_survivors_keep_relative_order(old: Vec<(u8, u8)>, new: Vec<(u8, u8)>) -> bool {
    let old = rows(old);
    let new = rows(new);
    let diff = CollectionDiff::between(&old, &new);
    let moved: HashSet<usize> = diff.moved.iter().map(|(_, n)| *n).collect();
    let inserted: HashSet<usize> = diff.inserted.iter().copied().collect();

    let old_positions: Vec<usize> = new
        .iter()
        .enumerate()
        .filter(|(i, _)| !moved.contains(i) && !inserted.contains(i))
        .filter_map(|(_, r)| old.iter().position(|o| o.id == r.id))
        .collect();
    old_positions.windows(2).all(|w| w[0] < w[1])
}

#[test]
fn quickcheck_diff_consistency() {
    quickcheck(diff_accounts_for_every_record as fn(Vec<(u8, u8)>, Vec<(u8, u8)>) -> TestResult);
}

#[test]
fn quickcheck_diff_stable_order() {
    quickcheck(unmoved_survivors_keep_relative_order as fn(Vec<(u8, u8)>, Vec<(u8, u8)>) -> bool);
}

#[test]
fn test_diff_of_reordering() {
    let old = rows(vec![(1, 0), (2, 0), (3, 0)]);
    let new = rows(vec![(3, 0), (1, 0), (2, 0)]);
    let diff = CollectionDiff::between(&old, &new);

    assert!(diff.inserted.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.moved, vec![(2, 0)]);
}
