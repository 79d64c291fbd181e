//! Error types for the replicated store client.

use thiserror::Error;

use crate::handle::NodeKind;

/// Errors returned by store reads and updates.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A field exists at the path but holds a different CRDT type.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Path of the offending field.
        path: String,
        /// Type the operation needed.
        expected: NodeKind,
        /// Type actually stored.
        found: NodeKind,
    },

    /// The store session was closed.
    #[error("store session closed")]
    Closed,

    /// Replica state lock was poisoned by a panicking writer.
    #[error("replica state poisoned: {0}")]
    Poisoned(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display() {
        let err = StoreError::TypeMismatch {
            path: "inode_1/size".to_string(),
            expected: NodeKind::Register,
            found: NodeKind::Counter,
        };
        assert_eq!(
            err.to_string(),
            "type mismatch at inode_1/size: expected register, found counter"
        );
    }

    #[test]
    fn test_closed_display() {
        assert_eq!(StoreError::Closed.to_string(), "store session closed");
    }
}
