#![cfg(feature = "serde")]

//! Integration tests for serde support.
//!
//! Vectors serialize as native sequences and maps as native objects; these
//! tests verify round-trips and nesting through `serde_json`.

use persimmon::{PersistentHashMap, PersistentVector};
use rstest::rstest;

// =============================================================================
// PersistentVector
// =============================================================================

#[rstest]
fn test_vector_json_roundtrip() {
    let vector: PersistentVector<i32> = (1..=100).collect();
    let json = serde_json::to_string(&vector).unwrap();
    let restored: PersistentVector<i32> = serde_json::from_str(&json).unwrap();
    assert_eq!(vector, restored);
}

#[rstest]
fn test_vector_serializes_as_native_sequence() {
    let vector: PersistentVector<i32> = vec![1, 2, 3].into();
    assert_eq!(serde_json::to_string(&vector).unwrap(), "[1,2,3]");
}

#[rstest]
fn test_empty_vector_roundtrip() {
    let vector: PersistentVector<i32> = PersistentVector::new();
    let json = serde_json::to_string(&vector).unwrap();
    assert_eq!(json, "[]");
    let restored: PersistentVector<i32> = serde_json::from_str(&json).unwrap();
    assert!(restored.is_empty());
}

#[rstest]
fn test_vector_nested_structures() {
    let inner1: PersistentVector<i32> = (1..=3).collect();
    let inner2: PersistentVector<i32> = (4..=6).collect();
    let outer: PersistentVector<PersistentVector<i32>> = vec![inner1, inner2].into();

    let json = serde_json::to_string(&outer).unwrap();
    assert_eq!(json, "[[1,2,3],[4,5,6]]");

    let restored: PersistentVector<PersistentVector<i32>> = serde_json::from_str(&json).unwrap();
    assert_eq!(outer, restored);
}

// =============================================================================
// PersistentHashMap
// =============================================================================

#[rstest]
fn test_map_json_roundtrip() {
    let map: PersistentHashMap<String, i32> = (0..50)
        .map(|index| (format!("key_{index}"), index))
        .collect();
    let json = serde_json::to_string(&map).unwrap();
    let restored: PersistentHashMap<String, i32> = serde_json::from_str(&json).unwrap();
    assert_eq!(map, restored);
}

#[rstest]
fn test_map_serializes_as_native_object() {
    let map = PersistentHashMap::new().insert("a".to_string(), 1);
    assert_eq!(serde_json::to_string(&map).unwrap(), "{\"a\":1}");
}

#[rstest]
fn test_empty_map_roundtrip() {
    let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    let json = serde_json::to_string(&map).unwrap();
    assert_eq!(json, "{}");
    let restored: PersistentHashMap<String, i32> = serde_json::from_str(&json).unwrap();
    assert!(restored.is_empty());
}

#[rstest]
fn test_map_of_vectors_roundtrip() {
    let map: PersistentHashMap<String, PersistentVector<i32>> = vec![
        ("evens".to_string(), vec![0, 2, 4].into()),
        ("odds".to_string(), vec![1, 3, 5].into()),
    ]
    .into();

    let json = serde_json::to_string(&map).unwrap();
    let restored: PersistentHashMap<String, PersistentVector<i32>> =
        serde_json::from_str(&json).unwrap();
    assert_eq!(map, restored);
}
