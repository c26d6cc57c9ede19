//! Error types for the query engine.
//!
//! Two families live here. [`QueryError`] describes problems with a query
//! string or a node handle as reported by the host tree. [`EngineError`]
//! describes broken calling-code invariants inside the engine itself; these
//! travel on a stream's error channel and terminate the affected
//! subscription.
//!
//! Recoverable conditions (no match, too many matches, hidden element) are
//! never errors: they are [`Outcome`](crate::outcome::Outcome) failures.

use thiserror::Error;

/// Errors reported by a host tree while evaluating a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The query string could not be parsed.
    #[error("malformed query `{query}` at offset {position}: {reason}")]
    Malformed {
        /// The offending query string.
        query: String,
        /// Byte offset of the first unparsable token.
        position: usize,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// A node handle does not refer to a node of this tree.
    #[error("unknown node {0}")]
    UnknownNode(u64),
}

/// Fatal engine errors.
///
/// Each variant indicates a programmer error in the code driving the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An attachment key was written twice on the same outcome.
    #[error("attachment `{0}` is already set on this outcome")]
    DuplicateAttachment(&'static str),

    /// Two attachment bags being merged both carry the same key.
    #[error("attachment `{0}` is present on both sides of a merge")]
    AttachmentCollision(&'static str),

    /// A reconciled key's inner subscription was torn down twice.
    #[error("subscription for key {0} was torn down twice")]
    DoubleTeardown(String),

    /// A projection inside an invalidation operator failed.
    #[error("projection failed: {0}")]
    Projection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_query_message_names_position() {
        let err = QueryError::Malformed {
            query: "//div[".to_string(),
            position: 6,
            reason: "unterminated predicate".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed query `//div[` at offset 6: unterminated predicate"
        );
    }
}
