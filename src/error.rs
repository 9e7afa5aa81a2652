//! Error type shared by both collections.

use thiserror::Error;

/// Errors surfaced by fallible collection operations.
///
/// Nothing is retried internally; every error propagates to the caller.
/// The `Option`-returning method variants (`get`, `pop_back`, map `get`)
/// translate the missing/out-of-range cases into `None` instead and never
/// fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectionError {
    /// An index was outside `0..length` of a vector, or a trailing element
    /// was requested from an empty vector.
    #[error("index {index} out of range for length {length}")]
    OutOfRange {
        /// The offending index.
        index: usize,
        /// The vector length at the time of the call.
        length: usize,
    },

    /// A map lookup or deletion named a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// A leaf-granularity trie operation was called with a wrong-sized leaf
    /// or on a trie that is not leaf-aligned.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// An operation was called on a transient that has already been
    /// persisted.
    #[error("transient has already been persisted")]
    InvalidTransient,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::CollectionError;
    use rstest::rstest;

    #[rstest]
    fn test_display_messages() {
        let out_of_range = CollectionError::OutOfRange {
            index: 7,
            length: 3,
        };
        assert_eq!(
            out_of_range.to_string(),
            "index 7 out of range for length 3"
        );
        assert_eq!(CollectionError::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            CollectionError::BadArgument("leaf must hold exactly 32 elements").to_string(),
            "bad argument: leaf must hold exactly 32 elements"
        );
        assert_eq!(
            CollectionError::InvalidTransient.to_string(),
            "transient has already been persisted"
        );
    }
}
