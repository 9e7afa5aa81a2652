//! Unit tests for PersistentHashMap.
//!
//! Covers the persistent contract, fallible lookups and deletions, the
//! default-value callback, merging, and iteration guarantees.

use persimmon::{CollectionError, PersistentHashMap, hashmap};
use rstest::rstest;

// =============================================================================
// Construction
// =============================================================================

#[rstest]
fn test_new_creates_empty_map() {
    let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get("anything"), None);
}

#[rstest]
fn test_from_pairs_and_macro_agree() {
    let from_pairs: PersistentHashMap<&str, i32> = vec![("a", 1), ("b", 2)].into();
    let via_macro = hashmap! { "a" => 1, "b" => 2 };
    assert_eq!(from_pairs, via_macro);
}

#[rstest]
fn test_from_native_mapping() {
    let mut native = std::collections::HashMap::new();
    native.insert("x".to_string(), 10);
    native.insert("y".to_string(), 20);

    let map: PersistentHashMap<String, i32> = native.into();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("x"), Some(&10));
}

// =============================================================================
// Set / get / delete scenario
// =============================================================================

#[rstest]
fn test_set_get_delete_scenario() {
    let map = PersistentHashMap::new()
        .insert("foo".to_string(), 1)
        .insert("bar".to_string(), 2)
        .insert("foo".to_string(), 3);

    assert_eq!(map.len(), 2);
    assert_eq!(map.get("foo"), Some(&3));
    assert_eq!(map.get("bar"), Some(&2));

    let without_bar = map.try_remove("bar").unwrap();
    assert_eq!(without_bar.len(), 1);
    assert!(!without_bar.contains_key("bar"));
    assert_eq!(
        without_bar.try_remove("bar"),
        Err(CollectionError::KeyNotFound)
    );

    // Originals are untouched throughout.
    assert_eq!(map.len(), 2);
    assert!(map.contains_key("bar"));
}

#[rstest]
fn test_insert_does_not_modify_original() {
    let base = PersistentHashMap::new().insert("key".to_string(), 1);
    let updated = base.insert("key".to_string(), 2);
    let extended = base.insert("other".to_string(), 3);

    assert_eq!(base.get("key"), Some(&1));
    assert_eq!(base.len(), 1);
    assert_eq!(updated.get("key"), Some(&2));
    assert_eq!(extended.len(), 2);
}

#[rstest]
fn test_delete_of_set_restores_entries() {
    let base: PersistentHashMap<i32, i32> = (0..50).map(|key| (key, key * 3)).collect();
    let with_extra = base.insert(100, 1);
    let restored = with_extra.try_remove(&100).unwrap();
    assert_eq!(restored, base);
}

// =============================================================================
// Fetch and the default callback
// =============================================================================

#[rstest]
fn test_fetch_without_default_fails_on_missing_key() {
    let map = PersistentHashMap::new().insert("a".to_string(), 1);
    assert_eq!(map.fetch(&"a".to_string()), Ok(1));
    assert_eq!(
        map.fetch(&"missing".to_string()),
        Err(CollectionError::KeyNotFound)
    );
}

#[rstest]
fn test_default_callback_survives_operations() {
    let map: PersistentHashMap<String, usize> =
        PersistentHashMap::with_default(|key: &String| key.len());
    let map = map.insert("stored".to_string(), 1);
    let map = map.remove("stored");

    // The callback is configuration and rides along every derived value.
    assert_eq!(map.fetch(&"seven77".to_string()), Ok(7));
    assert!(map.is_empty());
}

#[rstest]
fn test_explicit_fallbacks_win_over_callback() {
    let map: PersistentHashMap<String, usize> =
        PersistentHashMap::with_default(|key: &String| key.len());
    assert_eq!(map.fetch_or(&"abc".to_string(), 99), 99);
    assert_eq!(map.fetch_with(&"abc".to_string(), || 42), 42);
}

// =============================================================================
// Merge scenario
// =============================================================================

#[rstest]
fn test_merge_right_bias_scenario() {
    let left: PersistentHashMap<String, i32> =
        vec![("foo".to_string(), 1), ("bar".to_string(), 2)].into();
    let right: PersistentHashMap<String, i32> =
        vec![("foo".to_string(), 100), ("qux".to_string(), 5)].into();

    let merged = left.merge(&right);
    let expected: PersistentHashMap<String, i32> = vec![
        ("foo".to_string(), 100),
        ("bar".to_string(), 2),
        ("qux".to_string(), 5),
    ]
    .into();

    assert_eq!(merged, expected);
    assert_eq!(left.get("foo"), Some(&1)); // both originals unchanged
    assert_eq!(right.get("qux"), Some(&5));
}

#[rstest]
fn test_merge_entries_from_pairs() {
    let base: PersistentHashMap<String, i32> = vec![("a".to_string(), 1)].into();
    let merged = base.merge_entries(vec![("a".to_string(), 10), ("b".to_string(), 2)]);
    assert_eq!(merged.get("a"), Some(&10));
    assert_eq!(merged.get("b"), Some(&2));
    assert_eq!(base.len(), 1);
}

// =============================================================================
// Update helpers
// =============================================================================

#[rstest]
fn test_update_with_counter_pattern() {
    let counters: PersistentHashMap<String, i32> = PersistentHashMap::new();
    let counters = counters.update_with(&"hits".to_string(), |current| {
        Some(current.copied().unwrap_or(0) + 1)
    });
    let counters = counters.update_with(&"hits".to_string(), |current| {
        Some(current.copied().unwrap_or(0) + 1)
    });
    assert_eq!(counters.get("hits"), Some(&2));
}

#[rstest]
fn test_set_of_get_is_identity() {
    let map: PersistentHashMap<String, i32> =
        vec![("a".to_string(), 1), ("b".to_string(), 2)].into();
    let value = *map.get("a").unwrap();
    let same = map.insert("a".to_string(), value);
    assert_eq!(same, map);
}

// =============================================================================
// Iteration
// =============================================================================

#[rstest]
fn test_iteration_covers_every_entry_once() {
    let map: PersistentHashMap<i32, i32> = (0..300).map(|key| (key, key * 2)).collect();

    let mut seen: Vec<i32> = map.iter().map(|(key, _)| *key).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..300).collect::<Vec<_>>());
}

#[rstest]
fn test_iteration_order_is_stable_for_a_value() {
    let map: PersistentHashMap<String, i32> = (0..100)
        .map(|index| (format!("key_{index}"), index))
        .collect();

    let first: Vec<_> = map.iter().collect();
    let second: Vec<_> = map.iter().collect();
    assert_eq!(first, second);
}

#[rstest]
fn test_keys_values_and_into_iterator() {
    let map: PersistentHashMap<String, i32> =
        vec![("a".to_string(), 1), ("b".to_string(), 2)].into();

    assert_eq!(map.keys().count(), 2);
    let total: i32 = map.values().sum();
    assert_eq!(total, 3);

    let mut owned: Vec<(String, i32)> = map.clone().into_iter().collect();
    owned.sort();
    assert_eq!(owned, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
}

// =============================================================================
// Equality and rendering
// =============================================================================

#[rstest]
fn test_equality_is_order_insensitive() {
    let forward: PersistentHashMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
    let backward: PersistentHashMap<i32, i32> = (0..100).rev().map(|key| (key, key)).collect();
    assert_eq!(forward, backward);

    let different = forward.insert(0, 999);
    assert_ne!(forward, different);
}

#[rstest]
fn test_display_and_debug_render_native_forms() {
    let map = PersistentHashMap::new().insert("a".to_string(), 1);
    assert_eq!(map.to_string(), "Map {\"a\": 1}");
    assert_eq!(format!("{map:?}"), "{\"a\": 1}");
}

#[rstest]
fn test_native_round_trip() {
    let map: PersistentHashMap<String, i32> = (0..50)
        .map(|index| (format!("key_{index}"), index))
        .collect();
    let rebuilt: PersistentHashMap<String, i32> = map.to_hash_map().into();
    assert_eq!(map, rebuilt);
}
