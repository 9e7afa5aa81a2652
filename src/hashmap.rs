//! Persistent (immutable) hash map based on HAMT.
//!
//! This module provides [`PersistentHashMap`], an immutable hash map that
//! uses structural sharing for efficient operations, and
//! [`TransientHashMap`], its single-owner batch-editing counterpart.
//!
//! # Overview
//!
//! `PersistentHashMap` is a hash array mapped trie: edge selection at depth
//! *d* uses the *d*-th 5-bit group of the key's hash (lowest bits first),
//! and every node packs only its present children under a 32-bit bitmap.
//! A key whose hash has no groups left at a node's depth lives in that
//! node's entry bucket, where full-key equality resolves collisions.
//!
//! - O(log32 N) get, insert, remove (effectively O(1) for practical sizes)
//! - O(1) len and `is_empty`
//!
//! All operations return new maps without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Examples
//!
//! ```rust
//! use persimmon::PersistentHashMap;
//!
//! let map = PersistentHashMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2);
//!
//! assert_eq!(map.get("one"), Some(&1));
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;

use crate::bits;
use crate::error::CollectionError;
use crate::{OwnerToken, ReferenceCounter, next_owner_token};

// =============================================================================
// Hash computation
// =============================================================================

/// Computes the hash of a key using `DefaultHasher`.
fn compute_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// Node Definition
// =============================================================================

/// Internal node structure for the HAMT.
///
/// `children` is packed: it holds exactly `bitmap.count_ones()` entries, and
/// the child for bit index *i* sits at the popcount of the lower-ordered set
/// bits. `entries` is the bucket for keys whose hash is exhausted at this
/// node's depth; in leaves every pair lives there.
#[derive(Clone, Debug)]
struct MapNode<K, V> {
    bitmap: u32,
    children: Vec<ReferenceCounter<MapNode<K, V>>>,
    entries: Vec<(K, V)>,
    /// Cached pair count of the whole subtree.
    length: usize,
    owner: Option<OwnerToken>,
}

impl<K, V> MapNode<K, V> {
    /// Creates an empty, untagged node.
    const fn empty() -> Self {
        MapNode {
            bitmap: 0,
            children: Vec::new(),
            entries: Vec::new(),
            length: 0,
            owner: None,
        }
    }

    const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Makes `node` editable by `owner`; see the vector counterpart for the
/// copy-on-first-touch discipline.
fn edit_map_node<K: Clone, V: Clone>(
    node: &mut ReferenceCounter<MapNode<K, V>>,
    owner: OwnerToken,
) -> &mut MapNode<K, V> {
    if node.owner != Some(owner) {
        let mut editable = node.as_ref().clone();
        editable.owner = Some(owner);
        *node = ReferenceCounter::new(editable);
    }
    ReferenceCounter::make_mut(node)
}

/// Descends by hash fragments until the hash is exhausted, then scans the
/// bucket by key equality.
fn get_in_node<'a, K, V, Q>(
    node: &'a MapNode<K, V>,
    key: &Q,
    hash: u64,
    depth: usize,
) -> Option<&'a V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    if bits::hash_exhausted(hash, depth) {
        return node
            .entries
            .iter()
            .find(|(entry_key, _)| entry_key.borrow() == key)
            .map(|(_, value)| value);
    }

    let fragment = bits::hash_fragment(hash, depth);
    if node.bitmap & (1 << fragment) == 0 {
        return None;
    }
    let offset = bits::compact_offset(node.bitmap, fragment);
    node.children
        .get(offset)
        .and_then(|child| get_in_node(child, key, hash, depth + 1))
}

// =============================================================================
// PersistentHashMap Definition
// =============================================================================

/// Fallback invoked by [`PersistentHashMap::fetch`] on a missing key.
type DefaultFn<K, V> = dyn Fn(&K) -> V;

/// A persistent (immutable) hash map based on HAMT.
///
/// # Time Complexity
///
/// | Operation      | Complexity        |
/// |----------------|-------------------|
/// | `new`          | O(1)              |
/// | `get`          | O(log32 N)        |
/// | `insert`       | O(log32 N)        |
/// | `remove`       | O(log32 N)        |
/// | `contains_key` | O(log32 N)        |
/// | `len`          | O(1)              |
///
/// A map may carry a default-value callback (see
/// [`PersistentHashMap::with_default`]): [`PersistentHashMap::fetch`]
/// invokes it for missing keys instead of failing. The callback is
/// configuration, not content; it never inserts and is ignored by `==`.
///
/// # Examples
///
/// ```rust
/// use persimmon::PersistentHashMap;
///
/// let map = PersistentHashMap::singleton("key".to_string(), 42);
/// assert_eq!(map.get("key"), Some(&42));
/// ```
pub struct PersistentHashMap<K, V> {
    /// Root node of the trie; its cached length is the map size.
    root: ReferenceCounter<MapNode<K, V>>,
    /// Optional default-value callback consulted by `fetch`.
    default: Option<ReferenceCounter<DefaultFn<K, V>>>,
}

impl<K, V> Clone for PersistentHashMap<K, V> {
    fn clone(&self) -> Self {
        PersistentHashMap {
            root: self.root.clone(),
            default: self.default.clone(),
        }
    }
}

impl<K, V> PersistentHashMap<K, V> {
    /// Creates a new empty map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentHashMap {
            root: ReferenceCounter::new(MapNode::empty()),
            default: None,
        }
    }

    /// Creates an empty map carrying a default-value callback.
    ///
    /// The callback receives the missing key and produces a fallback value
    /// for [`PersistentHashMap::fetch`]; it does not insert.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, usize> =
    ///     PersistentHashMap::with_default(|key: &String| key.len());
    ///
    /// assert_eq!(map.fetch(&"four".to_string()), Ok(4));
    /// assert!(map.is_empty()); // fetch never inserts
    /// ```
    #[must_use]
    pub fn with_default<F>(default: F) -> Self
    where
        F: Fn(&K) -> V + 'static,
    {
        PersistentHashMap {
            root: ReferenceCounter::new(MapNode::empty()),
            default: Some(ReferenceCounter::new(default)),
        }
    }

    /// Returns the number of entries in the map.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.length
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.length == 0
    }

    /// Returns an iterator over key-value pairs.
    ///
    /// The order is unspecified but deterministic for a given value: two
    /// consecutive iterations of the same map yield the same sequence.
    #[must_use]
    pub fn iter(&self) -> PersistentHashMapIterator<'_, K, V> {
        PersistentHashMapIterator {
            stack: vec![IterFrame {
                node: self.root.as_ref(),
                entry_index: 0,
                child_index: 0,
            }],
            remaining: self.root.length,
        }
    }

    /// Returns an iterator over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Hash + Eq, V> PersistentHashMap<K, V> {
    /// Returns a reference to the value corresponding to the key, or
    /// `None` when absent.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new().insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = compute_hash(key);
        get_in_node(&self.root, key, hash, 0)
    }

    /// Returns `true` if the map contains a value for the specified key.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> PersistentHashMap<K, V> {
    /// Creates a map containing a single key-value pair.
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }

    /// Returns the value for `key` by clone, falling back to the map's
    /// default callback when the key is absent.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::KeyNotFound`] when the key is absent
    /// and the map carries no default callback.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::{CollectionError, PersistentHashMap};
    ///
    /// let map = PersistentHashMap::new().insert("a".to_string(), 1);
    /// assert_eq!(map.fetch(&"a".to_string()), Ok(1));
    /// assert_eq!(
    ///     map.fetch(&"b".to_string()),
    ///     Err(CollectionError::KeyNotFound)
    /// );
    /// ```
    pub fn fetch(&self, key: &K) -> Result<V, CollectionError> {
        if let Some(value) = self.get(key) {
            return Ok(value.clone());
        }
        match &self.default {
            Some(fallback) => Ok(fallback.as_ref()(key)),
            None => Err(CollectionError::KeyNotFound),
        }
    }

    /// Returns the value for `key` by clone, or the supplied default.
    ///
    /// The explicit default wins over the map's callback.
    #[must_use]
    pub fn fetch_or(&self, key: &K, default: V) -> V {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Returns the value for `key` by clone, or the result of `fallback`.
    ///
    /// The explicit fallback wins over the map's callback.
    #[must_use]
    pub fn fetch_with<F>(&self, key: &K, fallback: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.get(key).cloned().unwrap_or_else(fallback)
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
    /// let map2 = map1.insert("key".to_string(), 2);
    ///
    /// assert_eq!(map1.get("key"), Some(&1)); // Original unchanged
    /// assert_eq!(map2.get("key"), Some(&2)); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = compute_hash(&key);
        let (new_root, _) = Self::insert_in_node(&self.root, key, value, hash, 0);
        PersistentHashMap {
            root: ReferenceCounter::new(new_root),
            default: self.default.clone(),
        }
    }

    /// Recursive helper for insert.
    /// Returns (`new_node`, `was_added`).
    fn insert_in_node(
        node: &MapNode<K, V>,
        key: K,
        value: V,
        hash: u64,
        depth: usize,
    ) -> (MapNode<K, V>, bool) {
        if bits::hash_exhausted(hash, depth) {
            let mut entries = node.entries.clone();
            let added = match entries.iter_mut().find(|(entry_key, _)| *entry_key == key) {
                Some(entry) => {
                    entry.1 = value;
                    false
                }
                None => {
                    entries.push((key, value));
                    true
                }
            };
            return (
                MapNode {
                    bitmap: node.bitmap,
                    children: node.children.clone(),
                    entries,
                    length: node.length + usize::from(added),
                    owner: None,
                },
                added,
            );
        }

        let fragment = bits::hash_fragment(hash, depth);
        let bit = 1u32 << fragment;
        let offset = bits::compact_offset(node.bitmap, fragment);

        if node.bitmap & bit == 0 {
            // Unset slot: build the chain down to the exhaustion depth.
            let child = Self::entry_chain(key, value, hash, depth + 1);
            let mut children = node.children.clone();
            children.insert(offset, ReferenceCounter::new(child));
            (
                MapNode {
                    bitmap: node.bitmap | bit,
                    children,
                    entries: node.entries.clone(),
                    length: node.length + 1,
                    owner: None,
                },
                true,
            )
        } else {
            let (new_child, added) = match node.children.get(offset) {
                Some(child) => Self::insert_in_node(child, key, value, hash, depth + 1),
                // Packed-children invariant violated; rebuild the slot.
                None => (Self::entry_chain(key, value, hash, depth + 1), true),
            };
            let mut children = node.children.clone();
            if offset < children.len() {
                children[offset] = ReferenceCounter::new(new_child);
            } else {
                children.push(ReferenceCounter::new(new_child));
            }
            (
                MapNode {
                    bitmap: node.bitmap,
                    children,
                    entries: node.entries.clone(),
                    length: node.length + usize::from(added),
                    owner: None,
                },
                added,
            )
        }
    }

    /// Single-entry chain from `depth` down to the hash's exhaustion depth.
    fn entry_chain(key: K, value: V, hash: u64, depth: usize) -> MapNode<K, V> {
        if bits::hash_exhausted(hash, depth) {
            MapNode {
                bitmap: 0,
                children: Vec::new(),
                entries: vec![(key, value)],
                length: 1,
                owner: None,
            }
        } else {
            let fragment = bits::hash_fragment(hash, depth);
            MapNode {
                bitmap: 1 << fragment,
                children: vec![ReferenceCounter::new(Self::entry_chain(
                    key,
                    value,
                    hash,
                    depth + 1,
                ))],
                entries: Vec::new(),
                length: 1,
                owner: None,
            }
        }
    }

    /// Removes a key from the map.
    ///
    /// Returns a new map without the key; when the key is absent the map is
    /// returned unchanged. Use [`PersistentHashMap::try_remove`] for the
    /// failing form.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// let removed = map.remove("a");
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1);
    /// assert_eq!(removed.get("a"), None);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.try_remove(key).unwrap_or_else(|_| self.clone())
    }

    /// Removes a key from the map, failing when it is absent.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::KeyNotFound`] when the key is not
    /// present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::{CollectionError, PersistentHashMap};
    ///
    /// let map = PersistentHashMap::new().insert("a".to_string(), 1);
    /// let removed = map.try_remove("a").unwrap();
    /// assert_eq!(
    ///     removed.try_remove("a"),
    ///     Err(CollectionError::KeyNotFound)
    /// );
    /// ```
    pub fn try_remove<Q>(&self, key: &Q) -> Result<Self, CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = compute_hash(key);
        let new_root = Self::remove_in_node(&self.root, key, hash, 0)?;
        Ok(PersistentHashMap {
            root: ReferenceCounter::new(new_root),
            default: self.default.clone(),
        })
    }

    /// Recursive helper for removal; drained children are pruned and their
    /// bitmap bit cleared.
    fn remove_in_node<Q>(
        node: &MapNode<K, V>,
        key: &Q,
        hash: u64,
        depth: usize,
    ) -> Result<MapNode<K, V>, CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if bits::hash_exhausted(hash, depth) {
            let position = node
                .entries
                .iter()
                .position(|(entry_key, _)| entry_key.borrow() == key)
                .ok_or(CollectionError::KeyNotFound)?;
            let mut entries = node.entries.clone();
            entries.remove(position);
            return Ok(MapNode {
                bitmap: node.bitmap,
                children: node.children.clone(),
                entries,
                length: node.length - 1,
                owner: None,
            });
        }

        let fragment = bits::hash_fragment(hash, depth);
        let bit = 1u32 << fragment;
        if node.bitmap & bit == 0 {
            return Err(CollectionError::KeyNotFound);
        }
        let offset = bits::compact_offset(node.bitmap, fragment);
        let child = node
            .children
            .get(offset)
            .ok_or(CollectionError::KeyNotFound)?;
        let new_child = Self::remove_in_node(child, key, hash, depth + 1)?;

        let mut children = node.children.clone();
        let mut bitmap = node.bitmap;
        if new_child.is_empty() {
            children.remove(offset);
            bitmap &= !bit;
        } else {
            children[offset] = ReferenceCounter::new(new_child);
        }
        Ok(MapNode {
            bitmap,
            children,
            entries: node.entries.clone(),
            length: node.length - 1,
            owner: None,
        })
    }

    /// Updates, inserts, or removes the value for a key through an updater
    /// receiving the current value.
    ///
    /// Returning `Some` inserts or replaces, returning `None` removes (a
    /// no-op when the key was absent).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new().insert("count".to_string(), 10);
    ///
    /// let bumped = map.update_with(&"count".to_string(), |value| {
    ///     value.map(|count| count + 1)
    /// });
    /// assert_eq!(bumped.get("count"), Some(&11));
    ///
    /// let dropped = map.update_with(&"count".to_string(), |_| None);
    /// assert_eq!(dropped.get("count"), None);
    /// ```
    #[must_use]
    pub fn update_with<F>(&self, key: &K, updater: F) -> Self
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let current = self.get(key);
        match (current.is_some(), updater(current)) {
            (_, Some(value)) => self.insert(key.clone(), value),
            (true, None) => self.remove(key),
            (false, None) => self.clone(),
        }
    }

    /// Merges two maps, right-biased: values from `other` win on key
    /// collision. The result keeps this map's default callback.
    ///
    /// The union is built through a transient, so this map's trie is reused
    /// and only `other`'s entries are re-inserted.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let left = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// let right = PersistentHashMap::new()
    ///     .insert("b".to_string(), 20)
    ///     .insert("c".to_string(), 3);
    ///
    /// let merged = left.merge(&right);
    ///
    /// assert_eq!(merged.get("a"), Some(&1));
    /// assert_eq!(merged.get("b"), Some(&20)); // From right
    /// assert_eq!(merged.get("c"), Some(&3));
    /// ```
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut core = TransientMapCore::from_persistent(self);
        for (key, value) in other.iter() {
            core.insert(key.clone(), value.clone());
        }
        core.into_persistent()
    }

    /// Merges the entries of a native mapping or pair sequence into this
    /// map, right-biased like [`PersistentHashMap::merge`].
    #[must_use]
    pub fn merge_entries<I>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut core = TransientMapCore::from_persistent(self);
        for (key, value) in entries {
            core.insert(key, value);
        }
        core.into_persistent()
    }

    /// Copies the entries into a native `HashMap`.
    #[must_use]
    pub fn to_hash_map(&self) -> HashMap<K, V> {
        self.iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Spawns a transient sharing this map's trie; close it with
    /// [`TransientHashMap::persist`].
    #[must_use]
    pub fn transient(&self) -> TransientHashMap<K, V> {
        TransientHashMap {
            core: Some(TransientMapCore::from_persistent(self)),
        }
    }

    /// Runs a batch of mutations through a transient and persists the
    /// result.
    ///
    /// # Errors
    ///
    /// Propagates any error the closure returns.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<i32, i32> = PersistentHashMap::new();
    /// let filled = map
    ///     .batch(|transient| {
    ///         for key in 0..100 {
    ///             transient.insert(key, key * 10)?;
    ///         }
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// assert_eq!(filled.len(), 100);
    /// assert!(map.is_empty());
    /// ```
    pub fn batch<F>(&self, operations: F) -> Result<Self, CollectionError>
    where
        F: FnOnce(&mut TransientHashMap<K, V>) -> Result<(), CollectionError>,
    {
        let mut transient = self.transient();
        operations(&mut transient)?;
        transient.persist()
    }
}

// =============================================================================
// Transient Hash Map
// =============================================================================

/// Single-owner mutable state behind a live [`TransientHashMap`].
struct TransientMapCore<K, V> {
    root: ReferenceCounter<MapNode<K, V>>,
    default: Option<ReferenceCounter<DefaultFn<K, V>>>,
    owner: OwnerToken,
}

impl<K: Clone + Hash + Eq, V: Clone> TransientMapCore<K, V> {
    fn empty() -> Self {
        TransientMapCore {
            root: ReferenceCounter::new(MapNode::empty()),
            default: None,
            owner: next_owner_token(),
        }
    }

    fn from_persistent(map: &PersistentHashMap<K, V>) -> Self {
        TransientMapCore {
            root: map.root.clone(),
            default: map.default.clone(),
            owner: next_owner_token(),
        }
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        let hash = compute_hash(&key);
        Self::insert_at(&mut self.root, key, value, hash, 0, self.owner)
    }

    fn insert_at(
        node: &mut ReferenceCounter<MapNode<K, V>>,
        key: K,
        value: V,
        hash: u64,
        depth: usize,
        owner: OwnerToken,
    ) -> bool {
        let node = edit_map_node(node, owner);

        if bits::hash_exhausted(hash, depth) {
            match node.entries.iter_mut().find(|(entry_key, _)| *entry_key == key) {
                Some(entry) => {
                    entry.1 = value;
                    false
                }
                None => {
                    node.entries.push((key, value));
                    node.length += 1;
                    true
                }
            }
        } else {
            let fragment = bits::hash_fragment(hash, depth);
            let bit = 1u32 << fragment;
            let offset = bits::compact_offset(node.bitmap, fragment);

            if node.bitmap & bit == 0 {
                let child = Self::owned_chain(key, value, hash, depth + 1, owner);
                node.children.insert(offset, ReferenceCounter::new(child));
                node.bitmap |= bit;
                node.length += 1;
                true
            } else {
                let added = match node.children.get_mut(offset) {
                    Some(child) => Self::insert_at(child, key, value, hash, depth + 1, owner),
                    None => false,
                };
                if added {
                    node.length += 1;
                }
                added
            }
        }
    }

    /// Owner-tagged variant of the single-entry chain.
    fn owned_chain(key: K, value: V, hash: u64, depth: usize, owner: OwnerToken) -> MapNode<K, V> {
        if bits::hash_exhausted(hash, depth) {
            MapNode {
                bitmap: 0,
                children: Vec::new(),
                entries: vec![(key, value)],
                length: 1,
                owner: Some(owner),
            }
        } else {
            let fragment = bits::hash_fragment(hash, depth);
            MapNode {
                bitmap: 1 << fragment,
                children: vec![ReferenceCounter::new(Self::owned_chain(
                    key,
                    value,
                    hash,
                    depth + 1,
                    owner,
                ))],
                entries: Vec::new(),
                length: 1,
                owner: Some(owner),
            }
        }
    }

    fn remove<Q>(&mut self, key: &Q) -> Result<(), CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = compute_hash(key);
        // Probe first so a missing key leaves the path untouched.
        if get_in_node(&self.root, key, hash, 0).is_none() {
            return Err(CollectionError::KeyNotFound);
        }
        Self::remove_at(&mut self.root, key, hash, 0, self.owner);
        Ok(())
    }

    /// In-place removal of a key known to be present.
    fn remove_at<Q>(
        node: &mut ReferenceCounter<MapNode<K, V>>,
        key: &Q,
        hash: u64,
        depth: usize,
        owner: OwnerToken,
    ) where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let node = edit_map_node(node, owner);
        node.length -= 1;

        if bits::hash_exhausted(hash, depth) {
            if let Some(position) = node
                .entries
                .iter()
                .position(|(entry_key, _)| entry_key.borrow() == key)
            {
                node.entries.remove(position);
            }
            return;
        }

        let fragment = bits::hash_fragment(hash, depth);
        let bit = 1u32 << fragment;
        if node.bitmap & bit == 0 {
            return;
        }
        let offset = bits::compact_offset(node.bitmap, fragment);
        let drained = match node.children.get_mut(offset) {
            Some(child) => {
                Self::remove_at(child, key, hash, depth + 1, owner);
                child.is_empty()
            }
            None => false,
        };
        if drained {
            node.children.remove(offset);
            node.bitmap &= !bit;
        }
    }

    /// Clears the root's owner token and freezes the state into a
    /// persistent map.
    fn into_persistent(mut self) -> PersistentHashMap<K, V> {
        if self.root.owner.is_some() {
            ReferenceCounter::make_mut(&mut self.root).owner = None;
        }
        PersistentHashMap {
            root: self.root,
            default: self.default,
        }
    }
}

/// A single-owner, in-place-mutable view over a [`PersistentHashMap`].
///
/// The first touch of a shared node copies and stamps it with the
/// transient's owner token; later touches mutate in place.
/// [`TransientHashMap::persist`] closes the transient; any call after that
/// fails with [`CollectionError::InvalidTransient`].
///
/// Transients are single-threaded by contract.
///
/// # Examples
///
/// ```rust
/// use persimmon::TransientHashMap;
///
/// let mut transient: TransientHashMap<String, i32> = TransientHashMap::new();
/// transient.insert("a".to_string(), 1).unwrap();
/// transient.insert("b".to_string(), 2).unwrap();
/// let map = transient.persist().unwrap();
///
/// assert_eq!(map.len(), 2);
/// assert!(transient.insert("c".to_string(), 3).is_err()); // consumed
/// ```
pub struct TransientHashMap<K, V> {
    /// `None` once the transient has been persisted.
    core: Option<TransientMapCore<K, V>>,
}

impl<K, V> TransientHashMap<K, V> {
    fn core(&self) -> Result<&TransientMapCore<K, V>, CollectionError> {
        self.core.as_ref().ok_or(CollectionError::InvalidTransient)
    }

    fn core_mut(&mut self) -> Result<&mut TransientMapCore<K, V>, CollectionError> {
        self.core.as_mut().ok_or(CollectionError::InvalidTransient)
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn len(&self) -> Result<usize, CollectionError> {
        Ok(self.core()?.root.length)
    }

    /// Returns `true` if the transient holds no entries.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.core()?.root.length == 0)
    }
}

impl<K: Clone + Hash + Eq, V: Clone> TransientHashMap<K, V> {
    /// Creates an empty transient map with a fresh owner token.
    #[must_use]
    pub fn new() -> Self {
        TransientHashMap {
            core: Some(TransientMapCore::empty()),
        }
    }

    /// Returns a reference to the value for `key`, `None` when absent.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn get<Q>(&self, key: &Q) -> Result<Option<&V>, CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let core = self.core()?;
        let hash = compute_hash(key);
        Ok(get_in_node(&core.root, key, hash, 0))
    }

    /// Returns `true` if the transient contains the key.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn contains_key<Q>(&self, key: &Q) -> Result<bool, CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts a key-value pair in place, replacing an existing value.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), CollectionError> {
        self.core_mut()?.insert(key, value);
        Ok(())
    }

    /// Inserts a batch of entries, last value per key winning, and returns
    /// the transient for chaining.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::TransientHashMap;
    ///
    /// let map = TransientHashMap::new()
    ///     .insert_bulk(vec![("a".to_string(), 1), ("b".to_string(), 2)])
    ///     .unwrap()
    ///     .persist()
    ///     .unwrap();
    ///
    /// assert_eq!(map.len(), 2);
    /// ```
    pub fn insert_bulk<I>(mut self, entries: I) -> Result<Self, CollectionError>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let core = self.core_mut()?;
        for (key, value) in entries {
            core.insert(key, value);
        }
        Ok(self)
    }

    /// Removes a key in place.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::KeyNotFound`] when the key is absent
    /// and [`CollectionError::InvalidTransient`] after `persist`.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<(), CollectionError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.core_mut()?.remove(key)
    }

    /// Closes the transient and returns the persistent result; the
    /// transient moves to its consumed state.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] when called twice.
    pub fn persist(&mut self) -> Result<PersistentHashMap<K, V>, CollectionError> {
        let core = self.core.take().ok_or(CollectionError::InvalidTransient)?;
        Ok(core.into_persistent())
    }
}

impl<K: Clone + Hash + Eq, V: Clone> Default for TransientHashMap<K, V> {
    #[inline]
    fn default() -> Self {
        TransientHashMap::new()
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// One step of the depth-first walk: bucket entries first, then children in
/// bitmap order.
struct IterFrame<'a, K, V> {
    node: &'a MapNode<K, V>,
    entry_index: usize,
    child_index: usize,
}

/// An iterator over key-value pairs of a [`PersistentHashMap`].
///
/// The order is unspecified but deterministic for a given map value.
pub struct PersistentHashMapIterator<'a, K, V> {
    stack: Vec<IterFrame<'a, K, V>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for PersistentHashMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if let Some((key, value)) = frame.node.entries.get(frame.entry_index) {
                frame.entry_index += 1;
                self.remaining = self.remaining.saturating_sub(1);
                return Some((key, value));
            }
            match frame.node.children.get(frame.child_index) {
                Some(child) => {
                    frame.child_index += 1;
                    self.stack.push(IterFrame {
                        node: child.as_ref(),
                        entry_index: 0,
                        child_index: 0,
                    });
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for PersistentHashMapIterator<'_, K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

/// An owning iterator over key-value pairs of a [`PersistentHashMap`].
pub struct PersistentHashMapIntoIterator<K, V> {
    entries: Vec<(K, V)>,
    current_index: usize,
}

impl<K: Clone, V: Clone> Iterator for PersistentHashMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.current_index).cloned();
        self.current_index += 1;
        entry
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len().saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<K: Clone, V: Clone> ExactSizeIterator for PersistentHashMapIntoIterator<K, V> {
    fn len(&self) -> usize {
        self.entries.len().saturating_sub(self.current_index)
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for PersistentHashMap<K, V> {
    #[inline]
    fn default() -> Self {
        PersistentHashMap::new()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> FromIterator<(K, V)> for PersistentHashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut core = TransientMapCore::empty();
        for (key, value) in iter {
            core.insert(key, value);
        }
        core.into_persistent()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> From<HashMap<K, V>> for PersistentHashMap<K, V> {
    fn from(mapping: HashMap<K, V>) -> Self {
        mapping.into_iter().collect()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> From<Vec<(K, V)>> for PersistentHashMap<K, V> {
    fn from(entries: Vec<(K, V)>) -> Self {
        entries.into_iter().collect()
    }
}

impl<K: Clone + Hash + Eq, V: Clone> IntoIterator for PersistentHashMap<K, V> {
    type Item = (K, V);
    type IntoIter = PersistentHashMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentHashMapIntoIterator {
            entries,
            current_index: 0,
        }
    }
}

impl<'a, K, V> IntoIterator for &'a PersistentHashMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentHashMapIterator<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Hash + Eq, V: PartialEq> PartialEq for PersistentHashMap<K, V> {
    /// Entry-wise equality; the default callback is ignored.
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        // Identity shortcut: the same backing trie holds the same entries.
        if ReferenceCounter::ptr_eq(&self.root, &other.root) {
            return true;
        }
        self.iter().all(|(key, value)| {
            other
                .get(key)
                .is_some_and(|other_value| other_value == value)
        })
    }
}

impl<K: Hash + Eq, V: Eq> Eq for PersistentHashMap<K, V> {}

impl<K: Hash, V: Hash> Hash for PersistentHashMap<K, V> {
    /// Order-insensitive: per-entry hashes are combined commutatively so
    /// equal maps hash equally regardless of iteration order.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        let mut combined: u64 = 0;
        for (key, value) in self.iter() {
            let mut entry_hasher = DefaultHasher::new();
            key.hash(&mut entry_hasher);
            value.hash(&mut entry_hasher);
            combined = combined.wrapping_add(entry_hasher.finish());
        }
        combined.hash(state);
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentHashMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Display for PersistentHashMap<K, V> {
    /// Type-tagged textual dump: `Map {..}` followed by the native pretty
    /// form of the entries.
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Map ")?;
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for PersistentHashMap<K, V>
where
    K: serde::Serialize,
    V: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut mapping = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            mapping.serialize_entry(key, value)?;
        }
        mapping.end()
    }
}

#[cfg(feature = "serde")]
struct PersistentHashMapVisitor<K, V> {
    marker: std::marker::PhantomData<(K, V)>,
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Visitor<'de> for PersistentHashMapVisitor<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone,
{
    type Value = PersistentHashMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut core = TransientMapCore::empty();
        while let Some((key, value)) = access.next_entry()? {
            core.insert(key, value);
        }
        Ok(core.into_persistent())
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for PersistentHashMap<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PersistentHashMapVisitor {
            marker: std::marker::PhantomData,
        })
    }
}

// =============================================================================
// Macros
// =============================================================================

/// Creates a [`PersistentHashMap`] from `key => value` pairs.
///
/// # Examples
///
/// ```rust
/// use persimmon::hashmap;
///
/// let map = hashmap! {
///     "a" => 1,
///     "b" => 2,
/// };
/// assert_eq!(map.len(), 2);
/// assert_eq!(map.get("b"), Some(&2));
/// ```
#[macro_export]
macro_rules! hashmap {
    () => {
        $crate::PersistentHashMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::PersistentHashMap::from(vec![$(($key, $value)),+])
    };
}

// =============================================================================
// Tests
// =============================================================================
