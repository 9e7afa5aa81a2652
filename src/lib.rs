//! # persimmon
//!
//! Persistent (immutable) collections with structural sharing:
//!
//! - [`PersistentVector`]: an ordered, integer-indexed sequence backed by a
//!   32-way bit-partitioned trie with a tail buffer.
//! - [`PersistentHashMap`]: an unordered key-value mapping backed by a
//!   bitmap-indexed hash array mapped trie (HAMT).
//!
//! Every "mutating" operation returns a new logical value while the original
//! remains observable and unchanged; the new value shares most of its
//! internal structure with the old one, so single-element updates cost
//! O(log32 N) node copies rather than a full copy.
//!
//! ## Transients
//!
//! Both structures come with a transient counterpart ([`TransientVector`],
//! [`TransientHashMap`]): a short-lived, single-owner view that batches many
//! updates in place and is closed with `persist`, which yields a persistent
//! value and invalidates the transient. Persistent values are safe to share
//! between threads (with the `arc` feature); transients are single-threaded
//! by contract.
//!
//! ## Example
//!
//! ```rust
//! use persimmon::PersistentVector;
//!
//! let vector: PersistentVector<i32> = (0..100).collect();
//! let updated = vector.update(50, 999);
//!
//! assert_eq!(vector.get(50), Some(&50));            // original unchanged
//! assert_eq!(updated.and_then(|v| v.get(50).copied()), Some(999));
//! ```
//!
//! ## Feature flags
//!
//! - `arc`: use `Arc` instead of `Rc` for internal nodes, making persistent
//!   values `Send + Sync`.
//! - `serde`: `Serialize`/`Deserialize` as a native sequence / map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Reference Counter Type Alias
// =============================================================================

/// Reference-counted smart pointer type.
///
/// When the `arc` feature is enabled, this is `std::sync::Arc`,
/// which is thread-safe but has slightly higher overhead.
///
/// When the `arc` feature is disabled (default), this is `std::rc::Rc`,
/// which is faster but not thread-safe.
#[cfg(feature = "arc")]
pub(crate) type ReferenceCounter<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub(crate) type ReferenceCounter<T> = std::rc::Rc<T>;

// =============================================================================
// Transient Owner Tokens
// =============================================================================

/// Opaque identity carried by nodes a transient has created or converted to
/// mutable. Nodes built by persistent operations never carry one.
pub(crate) type OwnerToken = NonZeroU64;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Draws a token that no live transient shares. The counter is process-wide
/// and atomic so Arc-backed builds stay correct.
pub(crate) fn next_owner_token() -> OwnerToken {
    let raw = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
    OwnerToken::new(raw).unwrap_or(OwnerToken::MIN)
}

mod bits;
pub mod error;
pub mod hashmap;
pub mod vector;

pub use error::CollectionError;
pub use hashmap::PersistentHashMap;
pub use hashmap::PersistentHashMapIntoIterator;
pub use hashmap::PersistentHashMapIterator;
pub use hashmap::TransientHashMap;
pub use vector::PersistentVector;
pub use vector::PersistentVectorIntoIterator;
pub use vector::PersistentVectorIterator;
pub use vector::TransientVector;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod reference_counter_tests {
    use super::ReferenceCounter;
    use rstest::rstest;

    #[rstest]
    fn test_reference_counter_clone() {
        let reference_counter: ReferenceCounter<i32> = ReferenceCounter::new(42);
        let reference_counter_clone = reference_counter.clone();
        assert_eq!(*reference_counter, *reference_counter_clone);
    }

    #[rstest]
    fn test_reference_counter_strong_count() {
        let reference_counter: ReferenceCounter<i32> = ReferenceCounter::new(42);
        assert_eq!(ReferenceCounter::strong_count(&reference_counter), 1);
        let reference_counter_clone = reference_counter.clone();
        assert_eq!(ReferenceCounter::strong_count(&reference_counter), 2);
        drop(reference_counter_clone);
        assert_eq!(ReferenceCounter::strong_count(&reference_counter), 1);
    }
}

#[cfg(test)]
mod owner_token_tests {
    use super::next_owner_token;
    use rstest::rstest;

    #[rstest]
    fn test_tokens_are_unique() {
        let first = next_owner_token();
        let second = next_owner_token();
        assert_ne!(first, second);
    }
}
