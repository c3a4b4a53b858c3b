//! ============================================================================
//! Error Taxonomy - Failure classes for the memory subsystem
//! ============================================================================
//! Provider and Parse failures are absorbed locally (fallback extraction,
//! empty retrieval); Persistence failures skip the affected operation and the
//! batch continues. Memory is an enhancement, never a hard dependency.
//! ============================================================================

use thiserror::Error;

/// Result alias used throughout the memory subsystem
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Failure classes for memory operations
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Model or embedding call failed or timed out
    #[error("provider call failed: {0}")]
    Provider(String),

    /// Model output violates the extraction schema
    #[error("extraction output could not be parsed: {0}")]
    Parse(String),

    /// Store read/write failed
    #[error("memory store operation failed: {0}")]
    Persistence(String),

    /// A candidate or record fails field constraints
    #[error("validation failed: {0}")]
    Validation(String),
}

impl MemoryError {
    /// True for failures that extraction/retrieval must absorb locally
    /// rather than surface to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MemoryError::Provider(_) | MemoryError::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classes() {
        assert!(MemoryError::Provider("timeout".into()).is_recoverable());
        assert!(MemoryError::Parse("bad json".into()).is_recoverable());
        assert!(!MemoryError::Persistence("write failed".into()).is_recoverable());
        assert!(!MemoryError::Validation("empty text".into()).is_recoverable());
    }
}
