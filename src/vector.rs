//! Persistent (immutable) vector based on a bit-partitioned trie.
//!
//! This module provides [`PersistentVector`], an immutable dynamic array
//! that uses structural sharing for efficient operations, and
//! [`TransientVector`], its single-owner batch-editing counterpart.
//!
//! # Overview
//!
//! `PersistentVector` is a 32-way branching trie in the style of Clojure's
//! PersistentVector and Scala's Vector. It provides:
//!
//! - O(log32 N) random access (effectively O(1) for practical sizes)
//! - amortized O(1) push_back and pop_back thanks to the tail buffer
//! - O(log32 N) update
//! - O(1) len and is_empty
//!
//! All operations return new vectors without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Internal Structure
//!
//! The vector consists of:
//! - A root node (32-way branching trie) holding a multiple of 32 elements
//! - A tail buffer of 0..=31 elements for efficient append; the append that
//!   fills the 32nd slot pushes the buffer into the trie as a full leaf
//!
//! 31 of 32 appends and pops touch only the buffer; the remaining one walks
//! the rightmost trie path.
//!
//! # Examples
//!
//! ```rust
//! use persimmon::PersistentVector;
//!
//! let vector = PersistentVector::new()
//!     .push_back(1)
//!     .push_back(2)
//!     .push_back(3);
//!
//! assert_eq!(vector.get(0), Some(&1));
//! assert_eq!(vector.get(2), Some(&3));
//!
//! // Structural sharing: the original vector is preserved
//! let extended = vector.push_back(4);
//! assert_eq!(vector.len(), 3);     // Original unchanged
//! assert_eq!(extended.len(), 4);   // New vector
//! ```

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::mem;
use std::ops::{Add, BitAnd, BitOr, Sub};

use crate::bits::{self, BITS_PER_LEVEL, BRANCHING_FACTOR, MASK};
use crate::error::CollectionError;
use crate::{OwnerToken, ReferenceCounter, next_owner_token};

// =============================================================================
// Node Definition
// =============================================================================

/// Internal node structure for the vector trie.
///
/// Branches hold only children, leaves hold only elements. A node carries an
/// owner token exactly when it was created or converted to mutable by a
/// live transient; persistent paths always build untagged nodes.
#[derive(Clone)]
enum Node<T> {
    /// Branch node: packed children, cached subtree element count.
    Branch {
        children: Vec<ReferenceCounter<Node<T>>>,
        length: usize,
        owner: Option<OwnerToken>,
    },
    /// Leaf node holding up to 32 elements.
    Leaf {
        elements: Vec<T>,
        owner: Option<OwnerToken>,
    },
}

impl<T> Node<T> {
    /// Creates an empty, untagged branch node.
    const fn empty_branch() -> Self {
        Node::Branch {
            children: Vec::new(),
            length: 0,
            owner: None,
        }
    }

    /// Creates an untagged branch with the given children and cached count.
    const fn branch(children: Vec<ReferenceCounter<Node<T>>>, length: usize) -> Self {
        Node::Branch {
            children,
            length,
            owner: None,
        }
    }

    /// Creates an untagged leaf.
    const fn leaf(elements: Vec<T>) -> Self {
        Node::Leaf {
            elements,
            owner: None,
        }
    }

    /// Creates a leaf stamped with a transient's owner token.
    const fn owned_leaf(elements: Vec<T>, owner: OwnerToken) -> Self {
        Node::Leaf {
            elements,
            owner: Some(owner),
        }
    }

    /// Cached element count of the subtree below this node.
    fn len(&self) -> usize {
        match self {
            Node::Branch { length, .. } => *length,
            Node::Leaf { elements, .. } => elements.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn owner(&self) -> Option<OwnerToken> {
        match self {
            Node::Branch { owner, .. } | Node::Leaf { owner, .. } => *owner,
        }
    }

    fn set_owner(&mut self, new_owner: Option<OwnerToken>) {
        match self {
            Node::Branch { owner, .. } | Node::Leaf { owner, .. } => *owner = new_owner,
        }
    }
}

impl<T: Clone> Node<T> {
    /// Builds a chain of single-child branches from `shift` down to a leaf
    /// holding `elements`.
    fn new_path(shift: usize, elements: Vec<T>) -> Self {
        if shift == 0 {
            Node::leaf(elements)
        } else {
            let length = elements.len();
            Node::branch(
                vec![ReferenceCounter::new(Self::new_path(
                    shift - BITS_PER_LEVEL,
                    elements,
                ))],
                length,
            )
        }
    }

    /// Owner-tagged variant of [`Node::new_path`], used by transients.
    fn new_path_owned(shift: usize, elements: Vec<T>, owner: OwnerToken) -> Self {
        if shift == 0 {
            Node::owned_leaf(elements, owner)
        } else {
            let length = elements.len();
            Node::Branch {
                children: vec![ReferenceCounter::new(Self::new_path_owned(
                    shift - BITS_PER_LEVEL,
                    elements,
                    owner,
                ))],
                length,
                owner: Some(owner),
            }
        }
    }
}

/// Makes `node` editable by `owner`: a node already carrying the token is
/// mutated in place, any other node is cloned once and stamped so later
/// touches hit the in-place path.
fn edit_node<T: Clone>(
    node: &mut ReferenceCounter<Node<T>>,
    owner: OwnerToken,
) -> &mut Node<T> {
    if node.owner() != Some(owner) {
        let mut editable = node.as_ref().clone();
        editable.set_owner(Some(owner));
        *node = ReferenceCounter::new(editable);
    }
    ReferenceCounter::make_mut(node)
}

/// Bit-partitioned descent to the element at `index`.
fn get_in_trie<T>(root: &Node<T>, shift: usize, index: usize) -> Option<&T> {
    let mut node = root;
    let mut level_shift = shift;
    loop {
        match node {
            Node::Branch { children, .. } => {
                node = children.get(bits::child_index(index, level_shift))?.as_ref();
                level_shift = level_shift.saturating_sub(BITS_PER_LEVEL);
            }
            Node::Leaf { elements, .. } => return elements.get(index & MASK),
        }
    }
}

/// Descends to the aligned leaf chunk containing `index`.
fn leaf_in_trie<T>(root: &Node<T>, shift: usize, index: usize) -> &[T] {
    let mut node = root;
    let mut level_shift = shift;
    loop {
        match node {
            Node::Branch { children, .. } => {
                match children.get(bits::child_index(index, level_shift)) {
                    Some(child) => {
                        node = child.as_ref();
                        level_shift = level_shift.saturating_sub(BITS_PER_LEVEL);
                    }
                    None => return &[],
                }
            }
            Node::Leaf { elements, .. } => return elements,
        }
    }
}

// =============================================================================
// PersistentVector Definition
// =============================================================================

/// A persistent (immutable) vector based on a 32-way bit-partitioned trie
/// with a tail buffer.
///
/// # Time Complexity
///
/// | Operation    | Complexity                      |
/// |--------------|---------------------------------|
/// | `new`        | O(1)                            |
/// | `get`        | O(log32 N)                      |
/// | `push_back`  | amortized O(1)                  |
/// | `pop_back`   | amortized O(1)                  |
/// | `update`     | O(log32 N)                      |
/// | `len`        | O(1)                            |
/// | `iter`       | O(1) to create, O(N) to iterate |
///
/// # Examples
///
/// ```rust
/// use persimmon::PersistentVector;
///
/// let vector: PersistentVector<i32> = (0..100).collect();
/// assert_eq!(vector.len(), 100);
/// assert_eq!(vector.get(50), Some(&50));
/// ```
#[derive(Clone)]
pub struct PersistentVector<T> {
    /// Total number of elements (trie body + tail).
    length: usize,
    /// Shift of the root node: (depth - 1) * BITS_PER_LEVEL.
    shift: usize,
    /// Root of the trie body; always holds a multiple of 32 elements.
    root: ReferenceCounter<Node<T>>,
    /// Tail buffer of 0..=31 elements past the trie body.
    tail: ReferenceCounter<[T]>,
}

impl<T> PersistentVector<T> {
    /// Creates a new empty vector.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = PersistentVector::new();
    /// assert!(vector.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentVector {
            length: 0,
            shift: BITS_PER_LEVEL,
            root: ReferenceCounter::new(Node::empty_branch()),
            tail: ReferenceCounter::from(Vec::<T>::new()),
        }
    }

    /// Returns the number of elements in the vector.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the vector contains no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Index of the first tail element; equals the trie body size.
    #[inline]
    fn tail_offset(&self) -> usize {
        self.length - self.tail.len()
    }

    /// Returns a reference to the element at the given index, or `None`
    /// if the index is out of bounds.
    ///
    /// # Complexity
    ///
    /// O(log32 N); O(1) when the index falls into the tail buffer.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// assert_eq!(vector.get(0), Some(&1));
    /// assert_eq!(vector.get(4), Some(&5));
    /// assert_eq!(vector.get(10), None);
    /// ```
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.length {
            return None;
        }
        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            self.tail.get(index - tail_offset)
        } else {
            get_in_trie(&self.root, self.shift, index)
        }
    }

    /// Returns a reference to the element at the given index, or
    /// [`CollectionError::OutOfRange`].
    ///
    /// # Errors
    ///
    /// Fails when `index >= self.len()`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::{CollectionError, PersistentVector};
    ///
    /// let vector: PersistentVector<i32> = (1..=3).collect();
    /// assert_eq!(vector.try_get(1), Ok(&2));
    /// assert_eq!(
    ///     vector.try_get(3),
    ///     Err(CollectionError::OutOfRange { index: 3, length: 3 })
    /// );
    /// ```
    pub fn try_get(&self, index: usize) -> Result<&T, CollectionError> {
        self.get(index).ok_or(CollectionError::OutOfRange {
            index,
            length: self.length,
        })
    }

    /// Returns the element at `index`, or `fallback` when the index is out
    /// of bounds.
    #[must_use]
    pub fn get_or<'a>(&'a self, index: usize, fallback: &'a T) -> &'a T {
        self.get(index).unwrap_or(fallback)
    }

    /// Returns a reference to the first element, or `None` when empty.
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    /// Returns a reference to the last element, or `None` when empty.
    ///
    /// # Complexity
    ///
    /// O(1) while the tail buffer is non-empty, O(log32 N) right after a
    /// flush emptied it.
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else if let Some(element) = self.tail.last() {
            Some(element)
        } else {
            self.last_leaf().and_then(<[T]>::last)
        }
    }

    /// The elements of the rightmost trie leaf, if the trie body is
    /// non-empty. The tail buffer is not part of the trie; use
    /// [`PersistentVector::last`] for the logical last element.
    #[must_use]
    pub fn last_leaf(&self) -> Option<&[T]> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Branch { children, .. } => node = children.last()?.as_ref(),
                Node::Leaf { elements, .. } => return Some(elements),
            }
        }
    }

    /// Aligned 32-element chunk containing `index` (tail slice for the tail
    /// region). Used by the iterator.
    fn leaf_for(&self, index: usize) -> &[T] {
        if index >= self.tail_offset() {
            &self.tail
        } else {
            leaf_in_trie(&self.root, self.shift, index)
        }
    }

    /// Returns an iterator over references to the elements in index order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// let collected: Vec<&i32> = vector.iter().collect();
    /// assert_eq!(collected, vec![&1, &2, &3, &4, &5]);
    /// ```
    pub fn iter(&self) -> PersistentVectorIterator<'_, T> {
        PersistentVectorIterator {
            vector: self,
            leaf: &[],
            leaf_offset: 0,
            current_index: 0,
        }
    }

    /// Compares two vectors element-wise with a caller-supplied predicate.
    ///
    /// Returns `true` iff the lengths match and the predicate holds for
    /// every aligned pair.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let numbers: PersistentVector<i32> = (1..=3).collect();
    /// let doubled: PersistentVector<i32> = [2, 4, 6].into_iter().collect();
    /// assert!(numbers.eq_by(&doubled, |a, b| a * 2 == *b));
    /// ```
    pub fn eq_by<U, F>(&self, other: &PersistentVector<U>, mut predicate: F) -> bool
    where
        F: FnMut(&T, &U) -> bool,
    {
        self.length == other.length
            && self
                .iter()
                .zip(other.iter())
                .all(|(left, right)| predicate(left, right))
    }
}

impl<T: Clone> PersistentVector<T> {
    /// Creates a vector containing a single element.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector = PersistentVector::singleton(42);
    /// assert_eq!(vector.len(), 1);
    /// assert_eq!(vector.get(0), Some(&42));
    /// ```
    #[inline]
    #[must_use]
    pub fn singleton(element: T) -> Self {
        PersistentVector {
            length: 1,
            shift: BITS_PER_LEVEL,
            root: ReferenceCounter::new(Node::empty_branch()),
            tail: ReferenceCounter::from(vec![element]),
        }
    }

    /// Appends an element to the back of the vector.
    ///
    /// Returns a new vector with the element at the end. When the append
    /// fills the 32nd tail slot, the tail is pushed into the trie as a full
    /// leaf and the new vector starts an empty tail.
    ///
    /// # Complexity
    ///
    /// Amortized O(1); O(log32 N) on the flushing append.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector = PersistentVector::new().push_back(1).push_back(2);
    /// assert_eq!(vector.len(), 2);
    /// assert_eq!(vector.get(1), Some(&2));
    /// ```
    #[must_use]
    pub fn push_back(&self, element: T) -> Self {
        let mut new_tail = self.tail.to_vec();
        new_tail.push(element);

        if new_tail.len() == BRANCHING_FACTOR {
            let (root, shift) = self.append_leaf(new_tail);
            PersistentVector {
                length: self.length + 1,
                shift,
                root,
                tail: ReferenceCounter::from(Vec::new()),
            }
        } else {
            PersistentVector {
                length: self.length + 1,
                shift: self.shift,
                root: self.root.clone(),
                tail: ReferenceCounter::from(new_tail),
            }
        }
    }

    /// Removes the last element, returning the new vector and the element,
    /// or `None` when the vector is empty.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=4).collect();
    /// let (remaining, element) = vector.pop_back().unwrap();
    /// assert_eq!(element, 4);
    /// assert_eq!(remaining.len(), 3);
    ///
    /// let empty: PersistentVector<i32> = PersistentVector::new();
    /// assert_eq!(empty.pop_back(), None);
    /// ```
    #[must_use]
    pub fn pop_back(&self) -> Option<(Self, T)> {
        self.try_pop_back().ok()
    }

    /// Removes the last element, failing with
    /// [`CollectionError::OutOfRange`] when the vector is empty.
    ///
    /// # Errors
    ///
    /// Fails when the vector is empty.
    pub fn try_pop_back(&self) -> Result<(Self, T), CollectionError> {
        if self.is_empty() {
            return Err(CollectionError::OutOfRange {
                index: 0,
                length: 0,
            });
        }

        if self.tail.is_empty() {
            // The pop that follows a flush: reload the tail from the trie.
            let (root, shift, mut leaf) = self.remove_last_leaf();
            match leaf.pop() {
                Some(element) => Ok((
                    PersistentVector {
                        length: self.length - 1,
                        shift,
                        root,
                        tail: ReferenceCounter::from(leaf),
                    },
                    element,
                )),
                None => Err(CollectionError::OutOfRange {
                    index: 0,
                    length: 0,
                }),
            }
        } else {
            let mut new_tail = self.tail.to_vec();
            match new_tail.pop() {
                Some(element) => Ok((
                    PersistentVector {
                        length: self.length - 1,
                        shift: self.shift,
                        root: self.root.clone(),
                        tail: ReferenceCounter::from(new_tail),
                    },
                    element,
                )),
                None => Err(CollectionError::OutOfRange {
                    index: 0,
                    length: 0,
                }),
            }
        }
    }

    /// Replaces the element at the given index.
    ///
    /// Returns `None` if the index is out of bounds, otherwise a new vector
    /// with the element replaced.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// let updated = vector.update(2, 100).unwrap();
    ///
    /// assert_eq!(updated.get(2), Some(&100));
    /// assert_eq!(vector.get(2), Some(&3)); // Original unchanged
    /// ```
    #[must_use]
    pub fn update(&self, index: usize, element: T) -> Option<Self> {
        self.try_update(index, element).ok()
    }

    /// Replaces the element at the given index, failing with
    /// [`CollectionError::OutOfRange`] instead of returning `None`.
    ///
    /// # Errors
    ///
    /// Fails when `index >= self.len()`.
    pub fn try_update(&self, index: usize, element: T) -> Result<Self, CollectionError> {
        if index >= self.length {
            return Err(CollectionError::OutOfRange {
                index,
                length: self.length,
            });
        }

        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            let mut new_tail = self.tail.to_vec();
            if let Some(slot) = new_tail.get_mut(index - tail_offset) {
                *slot = element;
            }
            Ok(PersistentVector {
                length: self.length,
                shift: self.shift,
                root: self.root.clone(),
                tail: ReferenceCounter::from(new_tail),
            })
        } else {
            let new_root = Self::update_in_node(&self.root, self.shift, index, element);
            Ok(PersistentVector {
                length: self.length,
                shift: self.shift,
                root: ReferenceCounter::new(new_root),
                tail: self.tail.clone(),
            })
        }
    }

    /// Path-copying update: clones the branch chain down to the leaf, other
    /// children stay shared.
    fn update_in_node(node: &Node<T>, shift: usize, index: usize, element: T) -> Node<T> {
        match node {
            Node::Branch {
                children, length, ..
            } => {
                let slot = bits::child_index(index, shift);
                let mut new_children = children.clone();
                if let Some(child) = children.get(slot) {
                    new_children[slot] = ReferenceCounter::new(Self::update_in_node(
                        child,
                        shift - BITS_PER_LEVEL,
                        index,
                        element,
                    ));
                }
                Node::branch(new_children, *length)
            }
            Node::Leaf { elements, .. } => {
                let mut new_elements = elements.clone();
                if let Some(slot) = new_elements.get_mut(index & MASK) {
                    *slot = element;
                }
                Node::leaf(new_elements)
            }
        }
    }

    /// Appends a full leaf at the lowest available slot, splitting the root
    /// when the tree is full at its current level. Caller guarantees the
    /// leaf size; see [`Self::push_leaf`] for the checked form.
    fn append_leaf(&self, elements: Vec<T>) -> (ReferenceCounter<Node<T>>, usize) {
        let body_length = self.root.len();
        if body_length == bits::subtree_capacity(self.shift) {
            let added = elements.len();
            let path = Node::new_path(self.shift, elements);
            let root = Node::branch(
                vec![self.root.clone(), ReferenceCounter::new(path)],
                body_length + added,
            );
            (ReferenceCounter::new(root), self.shift + BITS_PER_LEVEL)
        } else {
            (
                ReferenceCounter::new(Self::append_leaf_into(&self.root, self.shift, elements)),
                self.shift,
            )
        }
    }

    fn append_leaf_into(node: &Node<T>, shift: usize, elements: Vec<T>) -> Node<T> {
        match node {
            Node::Branch {
                children, length, ..
            } => {
                let added = elements.len();
                let mut new_children = children.clone();
                if shift == BITS_PER_LEVEL {
                    new_children.push(ReferenceCounter::new(Node::leaf(elements)));
                } else {
                    let child_capacity = bits::subtree_capacity(shift - BITS_PER_LEVEL);
                    let descend = children
                        .last()
                        .is_some_and(|child| child.len() < child_capacity);
                    if descend {
                        let slot = new_children.len() - 1;
                        new_children[slot] = ReferenceCounter::new(Self::append_leaf_into(
                            &children[slot],
                            shift - BITS_PER_LEVEL,
                            elements,
                        ));
                    } else {
                        new_children.push(ReferenceCounter::new(Node::new_path(
                            shift - BITS_PER_LEVEL,
                            elements,
                        )));
                    }
                }
                Node::branch(new_children, length + added)
            }
            // Malformed tree; a well-formed descent stops at shift 5.
            Node::Leaf { .. } => Node::leaf(elements),
        }
    }

    /// Appends a full 32-element leaf at the lowest available slot of the
    /// trie.
    ///
    /// This is the leaf-granularity operation behind the tail flush; it is
    /// also usable directly for block-wise bulk loading.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::BadArgument`] when the leaf does not
    /// hold exactly 32 elements or the vector is not leaf-aligned
    /// (non-empty tail buffer).
    pub fn push_leaf(&self, elements: Vec<T>) -> Result<Self, CollectionError> {
        if elements.len() != BRANCHING_FACTOR {
            return Err(CollectionError::BadArgument(
                "leaf must hold exactly 32 elements",
            ));
        }
        if !self.tail.is_empty() {
            return Err(CollectionError::BadArgument("vector is not leaf-aligned"));
        }
        let added = elements.len();
        let (root, shift) = self.append_leaf(elements);
        Ok(PersistentVector {
            length: self.length + added,
            shift,
            root,
            tail: self.tail.clone(),
        })
    }

    /// Removes the rightmost leaf of the trie, mirroring
    /// [`PersistentVector::push_leaf`]. Returns the shrunk vector and the
    /// removed leaf's elements.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::BadArgument`] on a non-leaf-aligned
    /// vector and [`CollectionError::OutOfRange`] on an empty one.
    pub fn pop_leaf(&self) -> Result<(Self, Vec<T>), CollectionError> {
        if !self.tail.is_empty() {
            return Err(CollectionError::BadArgument("vector is not leaf-aligned"));
        }
        if self.is_empty() {
            return Err(CollectionError::OutOfRange {
                index: 0,
                length: 0,
            });
        }
        let (root, shift, leaf) = self.remove_last_leaf();
        Ok((
            PersistentVector {
                length: self.length - leaf.len(),
                shift,
                root,
                tail: self.tail.clone(),
            },
            leaf,
        ))
    }

    /// Removes the rightmost leaf, pruning drained branches and collapsing
    /// a single-child root. Caller guarantees a non-empty body.
    fn remove_last_leaf(&self) -> (ReferenceCounter<Node<T>>, usize, Vec<T>) {
        let (new_root, removed) = Self::remove_last_leaf_from(&self.root, self.shift);
        let mut root =
            new_root.map_or_else(|| ReferenceCounter::new(Node::empty_branch()), ReferenceCounter::new);
        let mut shift = self.shift;

        if shift > BITS_PER_LEVEL {
            let collapse = match root.as_ref() {
                Node::Branch { children, .. } if children.len() == 1 => children.first().cloned(),
                _ => None,
            };
            if let Some(only_child) = collapse {
                root = only_child;
                shift -= BITS_PER_LEVEL;
            }
        }

        (root, shift, removed)
    }

    /// Recursive helper: `None` means the subtree drained completely.
    fn remove_last_leaf_from(node: &Node<T>, shift: usize) -> (Option<Node<T>>, Vec<T>) {
        match node {
            Node::Branch {
                children, length, ..
            } => {
                let mut new_children = children.clone();
                let removed = if shift == BITS_PER_LEVEL {
                    new_children.pop().map_or_else(Vec::new, |leaf| match leaf.as_ref() {
                        Node::Leaf { elements, .. } => elements.clone(),
                        Node::Branch { .. } => Vec::new(),
                    })
                } else {
                    let removed = match children.last() {
                        Some(last) => {
                            let (new_child, removed) =
                                Self::remove_last_leaf_from(last, shift - BITS_PER_LEVEL);
                            let slot = new_children.len() - 1;
                            match new_child {
                                Some(child) => new_children[slot] = ReferenceCounter::new(child),
                                None => {
                                    new_children.pop();
                                }
                            }
                            removed
                        }
                        None => Vec::new(),
                    };
                    removed
                };

                if new_children.is_empty() {
                    (None, removed)
                } else {
                    (
                        Some(Node::branch(new_children, length - removed.len())),
                        removed,
                    )
                }
            }
            Node::Leaf { elements, .. } => (None, elements.clone()),
        }
    }

    /// Concatenates two vectors.
    ///
    /// Full 32-element blocks of the result are packed through a transient,
    /// so the left-hand trie is reused as-is and only the right-hand
    /// elements are re-appended.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let left: PersistentVector<i32> = (1..=3).collect();
    /// let right: PersistentVector<i32> = (4..=6).collect();
    /// let combined = left.append(&right);
    /// assert_eq!(combined.len(), 6);
    /// assert_eq!(combined.get(5), Some(&6));
    /// ```
    #[must_use]
    pub fn append(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let mut core = TransientCore::from_persistent(self);
        for element in other.iter() {
            core.push_back(element.clone());
        }
        core.into_persistent()
    }

    /// Returns a new vector holding the elements of `start..end`.
    ///
    /// `end` is clamped to the length; an empty or inverted range yields an
    /// empty vector.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let bounded_end = end.min(self.length);
        if start >= bounded_end {
            return PersistentVector::new();
        }
        let mut core = TransientCore::empty();
        for element in self.iter().skip(start).take(bounded_end - start) {
            core.push_back(element.clone());
        }
        core.into_persistent()
    }

    /// Copies the elements into a native `Vec` in index order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Spawns a transient sharing this vector's trie. The transient edits
    /// nodes in place once it owns them and is closed with
    /// [`TransientVector::persist`].
    #[must_use]
    pub fn transient(&self) -> TransientVector<T> {
        TransientVector {
            core: Some(TransientCore::from_persistent(self)),
        }
    }

    /// Runs a batch of mutations through a transient and persists the
    /// result: the closure receives the transient, and the final value is
    /// persisted and returned.
    ///
    /// # Errors
    ///
    /// Propagates any error the closure returns.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = PersistentVector::new();
    /// let filled = vector
    ///     .batch(|transient| {
    ///         for value in 0..100 {
    ///             transient.push_back(value)?;
    ///         }
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// assert_eq!(filled.len(), 100);
    /// assert!(vector.is_empty()); // original untouched
    /// ```
    pub fn batch<F>(&self, operations: F) -> Result<Self, CollectionError>
    where
        F: FnOnce(&mut TransientVector<T>) -> Result<(), CollectionError>,
    {
        let mut transient = self.transient();
        operations(&mut transient)?;
        transient.persist()
    }
}

impl<T: Clone + Hash + Eq> PersistentVector<T> {
    /// Removes duplicate elements, keeping the first occurrence of each.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimmon::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = [1, 2, 1, 3, 2].into_iter().collect();
    /// let unique = vector.uniq();
    /// assert_eq!(unique.to_vec(), vec![1, 2, 3]);
    /// ```
    #[must_use]
    pub fn uniq(&self) -> Self {
        let mut seen = HashSet::new();
        let mut core = TransientCore::empty();
        for element in self.iter() {
            if seen.insert(element) {
                core.push_back(element.clone());
            }
        }
        core.into_persistent()
    }

    /// Difference: elements of `self` not present in `other`, preserving
    /// left order.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let excluded: HashSet<&T> = other.iter().collect();
        let mut core = TransientCore::empty();
        for element in self.iter() {
            if !excluded.contains(element) {
                core.push_back(element.clone());
            }
        }
        core.into_persistent()
    }

    /// Intersection: elements of `self` also present in `other`, preserving
    /// left order and de-duplicated.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let allowed: HashSet<&T> = other.iter().collect();
        let mut seen = HashSet::new();
        let mut core = TransientCore::empty();
        for element in self.iter() {
            if allowed.contains(element) && seen.insert(element) {
                core.push_back(element.clone());
            }
        }
        core.into_persistent()
    }

    /// Union: every distinct element of `self` then of `other`, preserving
    /// first-occurrence order.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut seen = HashSet::new();
        let mut core = TransientCore::empty();
        for element in self.iter().chain(other.iter()) {
            if seen.insert(element) {
                core.push_back(element.clone());
            }
        }
        core.into_persistent()
    }
}

// =============================================================================
// Transient Vector
// =============================================================================

/// Single-owner mutable state behind a live [`TransientVector`].
struct TransientCore<T> {
    length: usize,
    shift: usize,
    root: ReferenceCounter<Node<T>>,
    tail: Vec<T>,
    owner: OwnerToken,
}

impl<T: Clone> TransientCore<T> {
    fn empty() -> Self {
        TransientCore {
            length: 0,
            shift: BITS_PER_LEVEL,
            root: ReferenceCounter::new(Node::empty_branch()),
            tail: Vec::new(),
            owner: next_owner_token(),
        }
    }

    fn from_persistent(vector: &PersistentVector<T>) -> Self {
        TransientCore {
            length: vector.length,
            shift: vector.shift,
            root: vector.root.clone(),
            tail: vector.tail.to_vec(),
            owner: next_owner_token(),
        }
    }

    fn tail_offset(&self) -> usize {
        self.length - self.tail.len()
    }

    fn get(&self, index: usize) -> Option<&T> {
        if index >= self.length {
            return None;
        }
        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            self.tail.get(index - tail_offset)
        } else {
            get_in_trie(&self.root, self.shift, index)
        }
    }

    fn push_back(&mut self, element: T) {
        self.tail.push(element);
        self.length += 1;
        if self.tail.len() == BRANCHING_FACTOR {
            let leaf = mem::take(&mut self.tail);
            self.append_leaf(leaf);
        }
    }

    fn append_leaf(&mut self, elements: Vec<T>) {
        let body_length = self.root.len();
        if body_length == bits::subtree_capacity(self.shift) {
            let added = elements.len();
            let path = Node::new_path_owned(self.shift, elements, self.owner);
            let new_root = Node::Branch {
                children: vec![self.root.clone(), ReferenceCounter::new(path)],
                length: body_length + added,
                owner: Some(self.owner),
            };
            self.root = ReferenceCounter::new(new_root);
            self.shift += BITS_PER_LEVEL;
        } else {
            Self::append_leaf_at(&mut self.root, self.shift, elements, self.owner);
        }
    }

    fn append_leaf_at(
        node: &mut ReferenceCounter<Node<T>>,
        shift: usize,
        elements: Vec<T>,
        owner: OwnerToken,
    ) {
        let added = elements.len();
        let node = edit_node(node, owner);
        if let Node::Branch {
            children, length, ..
        } = node
        {
            *length += added;
            if shift == BITS_PER_LEVEL {
                children.push(ReferenceCounter::new(Node::owned_leaf(elements, owner)));
            } else {
                let child_capacity = bits::subtree_capacity(shift - BITS_PER_LEVEL);
                let descend = children
                    .last()
                    .is_some_and(|child| child.len() < child_capacity);
                if descend {
                    if let Some(last) = children.last_mut() {
                        Self::append_leaf_at(last, shift - BITS_PER_LEVEL, elements, owner);
                    }
                } else {
                    children.push(ReferenceCounter::new(Node::new_path_owned(
                        shift - BITS_PER_LEVEL,
                        elements,
                        owner,
                    )));
                }
            }
        }
    }

    fn pop_back(&mut self) -> Option<T> {
        if self.length == 0 {
            return None;
        }
        if self.tail.is_empty() {
            self.tail = self.remove_last_leaf();
        }
        let element = self.tail.pop();
        if element.is_some() {
            self.length -= 1;
        }
        element
    }

    fn remove_last_leaf(&mut self) -> Vec<T> {
        let leaf = Self::remove_last_leaf_at(&mut self.root, self.shift, self.owner);

        if self.shift > BITS_PER_LEVEL {
            let collapse = match self.root.as_ref() {
                Node::Branch { children, .. } if children.len() == 1 => children.first().cloned(),
                _ => None,
            };
            if let Some(only_child) = collapse {
                self.root = only_child;
                self.shift -= BITS_PER_LEVEL;
            }
        }

        leaf
    }

    fn remove_last_leaf_at(
        node: &mut ReferenceCounter<Node<T>>,
        shift: usize,
        owner: OwnerToken,
    ) -> Vec<T> {
        let node = edit_node(node, owner);
        match node {
            Node::Branch {
                children, length, ..
            } => {
                let removed = if shift == BITS_PER_LEVEL {
                    children.pop().map_or_else(Vec::new, |leaf| {
                        match ReferenceCounter::try_unwrap(leaf) {
                            Ok(Node::Leaf { elements, .. }) => elements,
                            Ok(Node::Branch { .. }) => Vec::new(),
                            Err(shared) => match shared.as_ref() {
                                Node::Leaf { elements, .. } => elements.clone(),
                                Node::Branch { .. } => Vec::new(),
                            },
                        }
                    })
                } else {
                    let removed = match children.last_mut() {
                        Some(last) => {
                            Self::remove_last_leaf_at(last, shift - BITS_PER_LEVEL, owner)
                        }
                        None => Vec::new(),
                    };
                    if children.last().is_some_and(|child| child.is_empty()) {
                        children.pop();
                    }
                    removed
                };
                *length -= removed.len();
                removed
            }
            Node::Leaf { .. } => Vec::new(),
        }
    }

    fn update(&mut self, index: usize, element: T) -> Result<(), CollectionError> {
        if index >= self.length {
            return Err(CollectionError::OutOfRange {
                index,
                length: self.length,
            });
        }
        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            if let Some(slot) = self.tail.get_mut(index - tail_offset) {
                *slot = element;
            }
        } else {
            Self::update_at(&mut self.root, self.shift, index, element, self.owner);
        }
        Ok(())
    }

    fn update_at(
        node: &mut ReferenceCounter<Node<T>>,
        shift: usize,
        index: usize,
        element: T,
        owner: OwnerToken,
    ) {
        let node = edit_node(node, owner);
        match node {
            Node::Branch { children, .. } => {
                if let Some(child) = children.get_mut(bits::child_index(index, shift)) {
                    Self::update_at(child, shift - BITS_PER_LEVEL, index, element, owner);
                }
            }
            Node::Leaf { elements, .. } => {
                if let Some(slot) = elements.get_mut(index & MASK) {
                    *slot = element;
                }
            }
        }
    }

    /// Clears the root's owner token and freezes the state into a
    /// persistent vector. Tokens left on interior nodes are inert: no
    /// future transient can draw the same token, and persistent paths never
    /// consult them.
    fn into_persistent(mut self) -> PersistentVector<T> {
        if self.root.owner().is_some() {
            ReferenceCounter::make_mut(&mut self.root).set_owner(None);
        }
        PersistentVector {
            length: self.length,
            shift: self.shift,
            root: self.root,
            tail: ReferenceCounter::from(self.tail),
        }
    }
}

/// A single-owner, in-place-mutable view over a [`PersistentVector`].
///
/// A transient batches many updates without allocating intermediate
/// versions: the first touch of a shared node copies and stamps it with the
/// transient's owner token, and every later touch mutates in place.
/// [`TransientVector::persist`] closes the transient; any call after that
/// fails with [`CollectionError::InvalidTransient`].
///
/// Transients are single-threaded by contract: create, mutate, and persist
/// on one thread.
///
/// # Examples
///
/// ```rust
/// use persimmon::{PersistentVector, TransientVector};
///
/// let mut transient: TransientVector<i32> = TransientVector::new();
/// for value in 0..100 {
///     transient.push_back(value).unwrap();
/// }
/// let vector = transient.persist().unwrap();
///
/// assert_eq!(vector.len(), 100);
/// assert!(transient.push_back(0).is_err()); // consumed
/// ```
pub struct TransientVector<T> {
    /// `None` once the transient has been persisted.
    core: Option<TransientCore<T>>,
}

impl<T> TransientVector<T> {
    fn core(&self) -> Result<&TransientCore<T>, CollectionError> {
        self.core.as_ref().ok_or(CollectionError::InvalidTransient)
    }

    fn core_mut(&mut self) -> Result<&mut TransientCore<T>, CollectionError> {
        self.core.as_mut().ok_or(CollectionError::InvalidTransient)
    }

    /// Returns the number of elements.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn len(&self) -> Result<usize, CollectionError> {
        Ok(self.core()?.length)
    }

    /// Returns `true` if the transient holds no elements.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.core()?.length == 0)
    }
}

impl<T: Clone> TransientVector<T> {
    /// Creates an empty transient vector with a fresh owner token.
    #[must_use]
    pub fn new() -> Self {
        TransientVector {
            core: Some(TransientCore::empty()),
        }
    }

    /// Returns a reference to the element at `index`, `None` when out of
    /// bounds.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn get(&self, index: usize) -> Result<Option<&T>, CollectionError> {
        Ok(self.core()?.get(index))
    }

    /// Appends an element in place.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn push_back(&mut self, element: T) -> Result<(), CollectionError> {
        self.core_mut()?.push_back(element);
        Ok(())
    }

    /// Removes and returns the last element, `None` when empty.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] after `persist`.
    pub fn pop_back(&mut self) -> Result<Option<T>, CollectionError> {
        Ok(self.core_mut()?.pop_back())
    }

    /// Replaces the element at `index` in place.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::OutOfRange`] for a bad index and
    /// [`CollectionError::InvalidTransient`] after `persist`.
    pub fn update(&mut self, index: usize, element: T) -> Result<(), CollectionError> {
        self.core_mut()?.update(index, element)
    }

    /// Closes the transient and returns the persistent result.
    ///
    /// The owner token is cleared from the root, so every later operation
    /// on the returned vector takes the persistent clone path. The
    /// transient moves to its consumed state.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectionError::InvalidTransient`] when called twice.
    pub fn persist(&mut self) -> Result<PersistentVector<T>, CollectionError> {
        let core = self.core.take().ok_or(CollectionError::InvalidTransient)?;
        Ok(core.into_persistent())
    }
}

impl<T: Clone> Default for TransientVector<T> {
    #[inline]
    fn default() -> Self {
        TransientVector::new()
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// An iterator over references to elements of a [`PersistentVector`].
///
/// Walks the vector leaf by leaf, so a full traversal touches each branch
/// node once instead of once per element.
pub struct PersistentVectorIterator<'a, T> {
    vector: &'a PersistentVector<T>,
    leaf: &'a [T],
    leaf_offset: usize,
    current_index: usize,
}

impl<'a, T> Iterator for PersistentVectorIterator<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.vector.length {
            return None;
        }
        if self.leaf.is_empty() || self.current_index - self.leaf_offset >= self.leaf.len() {
            self.leaf_offset = self.current_index & !MASK;
            self.leaf = self.vector.leaf_for(self.current_index);
        }
        let item = self.leaf.get(self.current_index - self.leaf_offset)?;
        self.current_index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vector.length.saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for PersistentVectorIterator<'_, T> {
    fn len(&self) -> usize {
        self.vector.length.saturating_sub(self.current_index)
    }
}

/// An owning iterator over elements of a [`PersistentVector`].
pub struct PersistentVectorIntoIterator<T> {
    vector: PersistentVector<T>,
    current_index: usize,
}

impl<T: Clone> Iterator for PersistentVectorIntoIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.vector.get(self.current_index).cloned();
        self.current_index += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vector.length.saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for PersistentVectorIntoIterator<T> {
    fn len(&self) -> usize {
        self.vector.length.saturating_sub(self.current_index)
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<T> Default for PersistentVector<T> {
    #[inline]
    fn default() -> Self {
        PersistentVector::new()
    }
}

impl<T: Clone> FromIterator<T> for PersistentVector<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut core = TransientCore::empty();
        for element in iter {
            core.push_back(element);
        }
        core.into_persistent()
    }
}

impl<T: Clone> From<Vec<T>> for PersistentVector<T> {
    fn from(elements: Vec<T>) -> Self {
        elements.into_iter().collect()
    }
}

impl<T: Clone> From<&[T]> for PersistentVector<T> {
    fn from(elements: &[T]) -> Self {
        elements.iter().cloned().collect()
    }
}

impl<T: Clone> IntoIterator for PersistentVector<T> {
    type Item = T;
    type IntoIter = PersistentVectorIntoIterator<T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        PersistentVectorIntoIterator {
            vector: self,
            current_index: 0,
        }
    }
}

impl<'a, T> IntoIterator for &'a PersistentVector<T> {
    type Item = &'a T;
    type IntoIter = PersistentVectorIterator<'a, T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: PartialEq> PartialEq for PersistentVector<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.length != other.length {
            return false;
        }
        // Identity shortcut: same backing trie and equal tails.
        if ReferenceCounter::ptr_eq(&self.root, &other.root) && self.tail[..] == other.tail[..] {
            return true;
        }
        self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: Eq> Eq for PersistentVector<T> {}

impl<T: PartialOrd> PartialOrd for PersistentVector<T> {
    /// Lexicographic over elements; on prefix equality the shorter vector
    /// is less.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.iter().partial_cmp(other.iter())
    }
}

impl<T: Ord> Ord for PersistentVector<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.iter().cmp(other.iter())
    }
}

impl<T: Hash> Hash for PersistentVector<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.length.hash(state);
        for element in self.iter() {
            element.hash(state);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PersistentVector<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_list().entries(self.iter()).finish()
    }
}

impl<T: fmt::Debug> fmt::Display for PersistentVector<T> {
    /// Type-tagged textual dump: `Vector [..]` followed by the native
    /// pretty form of the elements.
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Vector ")?;
        formatter.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Clone> Add for PersistentVector<T> {
    type Output = PersistentVector<T>;

    /// Concatenation; see [`PersistentVector::append`].
    fn add(self, other: Self) -> Self::Output {
        self.append(&other)
    }
}

impl<T: Clone + Hash + Eq> Sub for PersistentVector<T> {
    type Output = PersistentVector<T>;

    /// Difference preserving left order; see
    /// [`PersistentVector::difference`].
    fn sub(self, other: Self) -> Self::Output {
        self.difference(&other)
    }
}

impl<T: Clone + Hash + Eq> BitAnd for PersistentVector<T> {
    type Output = PersistentVector<T>;

    /// Intersection preserving left order; see
    /// [`PersistentVector::intersection`].
    fn bitand(self, other: Self) -> Self::Output {
        self.intersection(&other)
    }
}

impl<T: Clone + Hash + Eq> BitOr for PersistentVector<T> {
    type Output = PersistentVector<T>;

    /// Union preserving first-occurrence order; see
    /// [`PersistentVector::union`].
    fn bitor(self, other: Self) -> Self::Output {
        self.union(&other)
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for PersistentVector<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;

        let mut sequence = serializer.serialize_seq(Some(self.length))?;
        for element in self.iter() {
            sequence.serialize_element(element)?;
        }
        sequence.end()
    }
}

#[cfg(feature = "serde")]
struct PersistentVectorVisitor<T> {
    marker: std::marker::PhantomData<T>,
}

#[cfg(feature = "serde")]
impl<'de, T> serde::de::Visitor<'de> for PersistentVectorVisitor<T>
where
    T: serde::Deserialize<'de> + Clone,
{
    type Value = PersistentVector<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a sequence")
    }

    fn visit_seq<A>(self, mut sequence: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut core = TransientCore::empty();
        while let Some(element) = sequence.next_element()? {
            core.push_back(element);
        }
        Ok(core.into_persistent())
    }
}

#[cfg(feature = "serde")]
impl<'de, T> serde::Deserialize<'de> for PersistentVector<T>
where
    T: serde::Deserialize<'de> + Clone,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(PersistentVectorVisitor {
            marker: std::marker::PhantomData,
        })
    }
}

// =============================================================================
// Macros
// =============================================================================

/// Creates a [`PersistentVector`] from a list of elements.
///
/// # Examples
///
/// ```rust
/// use persimmon::vector;
///
/// let vector = vector![1, 2, 3];
/// assert_eq!(vector.len(), 3);
/// assert_eq!(vector.get(2), Some(&3));
/// ```
#[macro_export]
macro_rules! vector {
    () => {
        $crate::PersistentVector::new()
    };
    ($($element:expr),+ $(,)?) => {
        $crate::PersistentVector::from(vec![$($element),+])
    };
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_new_creates_empty() {
        let vector: PersistentVector<i32> = PersistentVector::new();
        assert!(vector.is_empty());
        assert_eq!(vector.len(), 0);
    }

    #[rstest]
    fn test_push_back_and_get() {
        let vector = PersistentVector::new()
            .push_back(1)
            .push_back(2)
            .push_back(3);
        assert_eq!(vector.len(), 3);
        assert_eq!(vector.get(0), Some(&1));
        assert_eq!(vector.get(1), Some(&2));
        assert_eq!(vector.get(2), Some(&3));
    }

    #[rstest]
    fn test_tail_flushes_at_branching_factor() {
        let vector: PersistentVector<usize> = (0..BRANCHING_FACTOR).collect();
        assert_eq!(vector.tail_offset(), BRANCHING_FACTOR);
        assert!(vector.tail.is_empty());
        assert_eq!(vector.root.len(), BRANCHING_FACTOR);
        assert_eq!(vector.get(31), Some(&31));
        assert_eq!(vector.last(), Some(&31));
    }

    #[rstest]
    #[case(33)]
    #[case(1024)]
    #[case(1025)]
    #[case(1056)]
    #[case(2100)]
    #[case(33000)]
    fn test_large_vector_round_trip(#[case] size: usize) {
        let vector: PersistentVector<usize> = (0..size).collect();
        assert_eq!(vector.len(), size);
        for index in (0..size).step_by(7) {
            assert_eq!(vector.get(index), Some(&index));
        }
        assert_eq!(vector.get(size - 1), Some(&(size - 1)));
        assert_eq!(vector.get(size), None);
    }

    #[rstest]
    fn test_root_split_raises_shift() {
        let flat: PersistentVector<usize> = (0..1024).collect();
        assert_eq!(flat.shift, BITS_PER_LEVEL);

        let deep = (0..1056).collect::<PersistentVector<usize>>();
        assert_eq!(deep.shift, 2 * BITS_PER_LEVEL);
        assert_eq!(deep.get(1055), Some(&1055));
    }

    #[rstest]
    fn test_update_in_trie_and_tail() {
        let vector: PersistentVector<usize> = (0..100).collect();
        let trie_updated = vector.update(10, 999).unwrap();
        let tail_updated = vector.update(97, 888).unwrap();

        assert_eq!(trie_updated.get(10), Some(&999));
        assert_eq!(tail_updated.get(97), Some(&888));
        assert_eq!(vector.get(10), Some(&10));
        assert_eq!(vector.get(97), Some(&97));
    }

    #[rstest]
    fn test_try_update_out_of_range() {
        let vector: PersistentVector<i32> = (0..3).collect();
        assert_eq!(
            vector.try_update(3, 0),
            Err(CollectionError::OutOfRange {
                index: 3,
                length: 3
            })
        );
    }

    #[rstest]
    fn test_pop_back_reloads_tail_from_trie() {
        let vector: PersistentVector<usize> = (0..BRANCHING_FACTOR).collect();
        let (remaining, element) = vector.pop_back().unwrap();
        assert_eq!(element, 31);
        assert_eq!(remaining.len(), 31);
        assert_eq!(remaining.tail.len(), 31);
        assert!(remaining.root.is_empty());
        assert_eq!(vector.len(), BRANCHING_FACTOR);
    }

    #[rstest]
    fn test_pop_back_collapses_root() {
        let vector: PersistentVector<usize> = (0..1056).collect();
        let mut current = vector;
        for expected in (1024..1056).rev() {
            let (next, element) = current.pop_back().unwrap();
            assert_eq!(element, expected);
            current = next;
        }
        assert_eq!(current.len(), 1024);
        assert_eq!(current.shift, BITS_PER_LEVEL);
        assert_eq!(current.get(1023), Some(&1023));
    }

    #[rstest]
    fn test_try_pop_back_empty_fails() {
        let vector: PersistentVector<i32> = PersistentVector::new();
        assert_eq!(
            vector.try_pop_back(),
            Err(CollectionError::OutOfRange {
                index: 0,
                length: 0
            })
        );
        assert_eq!(vector.pop_back(), None);
    }

    #[rstest]
    fn test_push_leaf_rejects_wrong_size() {
        let vector: PersistentVector<usize> = (0..64).collect();
        let result = vector.push_leaf((0..10).collect());
        assert_eq!(
            result.unwrap_err(),
            CollectionError::BadArgument("leaf must hold exactly 32 elements")
        );
    }

    #[rstest]
    fn test_push_leaf_rejects_unaligned_vector() {
        let vector: PersistentVector<usize> = (0..40).collect();
        let result = vector.push_leaf((0..32).collect());
        assert_eq!(
            result.unwrap_err(),
            CollectionError::BadArgument("vector is not leaf-aligned")
        );
    }

    #[rstest]
    fn test_push_leaf_and_pop_leaf_round_trip() {
        let vector: PersistentVector<usize> = (0..64).collect();
        let grown = vector.push_leaf((64..96).collect()).unwrap();
        assert_eq!(grown.len(), 96);
        assert_eq!(grown.get(95), Some(&95));

        let (shrunk, leaf) = grown.pop_leaf().unwrap();
        assert_eq!(shrunk.len(), 64);
        assert_eq!(leaf, (64..96).collect::<Vec<_>>());
    }

    #[rstest]
    fn test_pop_leaf_empty_fails() {
        let vector: PersistentVector<usize> = PersistentVector::new();
        assert!(matches!(
            vector.pop_leaf(),
            Err(CollectionError::OutOfRange { .. })
        ));
    }

    #[rstest]
    fn test_last_leaf_tracks_rightmost() {
        let vector: PersistentVector<usize> = (0..96).collect();
        assert_eq!(vector.last_leaf().unwrap(), (64..96).collect::<Vec<_>>());
    }

    #[rstest]
    fn test_iter_crosses_leaf_boundaries() {
        let vector: PersistentVector<usize> = (0..2100).collect();
        let collected: Vec<usize> = vector.iter().copied().collect();
        assert_eq!(collected, (0..2100).collect::<Vec<_>>());
    }

    #[rstest]
    fn test_eq_uses_identity_shortcut() {
        let vector: PersistentVector<usize> = (0..100).collect();
        let alias = vector.clone();
        assert!(ReferenceCounter::ptr_eq(&vector.root, &alias.root));
        assert_eq!(vector, alias);

        let rebuilt: PersistentVector<usize> = (0..100).collect();
        assert!(!ReferenceCounter::ptr_eq(&vector.root, &rebuilt.root));
        assert_eq!(vector, rebuilt);
    }

    #[rstest]
    fn test_ordering_is_lexicographic() {
        let shorter: PersistentVector<i32> = vec![1, 2].into();
        let longer: PersistentVector<i32> = vec![1, 2, 3].into();
        let greater: PersistentVector<i32> = vec![1, 3].into();

        assert!(shorter < longer);
        assert!(longer < greater);
        assert_eq!(shorter.cmp(&shorter.clone()), Ordering::Equal);
    }

    #[rstest]
    fn test_display_is_type_tagged() {
        let vector: PersistentVector<i32> = vec![1, 2, 3].into();
        assert_eq!(vector.to_string(), "Vector [1, 2, 3]");
    }

    #[rstest]
    fn test_transient_edits_do_not_leak() {
        let vector: PersistentVector<usize> = (0..100).collect();
        let mut transient = vector.transient();
        for index in 0..100 {
            transient.update(index, index + 1000).unwrap();
        }
        let updated = transient.persist().unwrap();

        for index in 0..100 {
            assert_eq!(vector.get(index), Some(&index));
            assert_eq!(updated.get(index), Some(&(index + 1000)));
        }
    }

    #[rstest]
    fn test_transient_pop_back_drains() {
        let vector: PersistentVector<usize> = (0..70).collect();
        let mut transient = vector.transient();
        for expected in (0..70).rev() {
            assert_eq!(transient.pop_back().unwrap(), Some(expected));
        }
        assert_eq!(transient.pop_back().unwrap(), None);
        let drained = transient.persist().unwrap();
        assert!(drained.is_empty());
        assert_eq!(vector.len(), 70);
    }

    #[rstest]
    fn test_persist_clears_root_owner() {
        let mut transient: TransientVector<usize> = TransientVector::new();
        for index in 0..40 {
            transient.push_back(index).unwrap();
        }
        let vector = transient.persist().unwrap();
        assert_eq!(vector.root.owner(), None);
    }

    #[rstest]
    fn test_consumed_transient_fails_everywhere() {
        let mut transient: TransientVector<i32> = TransientVector::new();
        transient.push_back(1).unwrap();
        let _ = transient.persist().unwrap();

        assert_eq!(
            transient.push_back(2),
            Err(CollectionError::InvalidTransient)
        );
        assert_eq!(transient.pop_back(), Err(CollectionError::InvalidTransient));
        assert_eq!(
            transient.update(0, 0),
            Err(CollectionError::InvalidTransient)
        );
        assert_eq!(transient.len(), Err(CollectionError::InvalidTransient));
        assert_eq!(transient.get(0), Err(CollectionError::InvalidTransient));
        assert_eq!(
            transient.persist().unwrap_err(),
            CollectionError::InvalidTransient
        );
    }

    #[rstest]
    fn test_set_operations() {
        let left: PersistentVector<i32> = vec![1, 2, 3, 2, 4].into();
        let right: PersistentVector<i32> = vec![2, 4, 5].into();

        assert_eq!(left.clone().sub(right.clone()).to_vec(), vec![1, 3]);
        assert_eq!(left.clone().bitand(right.clone()).to_vec(), vec![2, 4]);
        assert_eq!(
            left.clone().bitor(right.clone()).to_vec(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(left.uniq().to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(
            (left + right).to_vec(),
            vec![1, 2, 3, 2, 4, 2, 4, 5]
        );
    }

    #[rstest]
    fn test_vector_macro() {
        let empty: PersistentVector<i32> = vector![];
        assert!(empty.is_empty());

        let built = vector![1, 2, 3];
        assert_eq!(built.to_vec(), vec![1, 2, 3]);
    }
}
