//! Error types for tiered-memory.

use thiserror::Error;

use crate::memory::Stage;

/// Result type alias using tiered-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A single entry is larger than the tier's configured capacity
    #[error("Entry of {size} bytes exceeds tier capacity of {capacity} bytes")]
    CapacityExceeded { size: usize, capacity: usize },

    /// A read found an entry past its TTL
    #[error("Entry has expired")]
    Expired,

    /// Episodic/semantic/persistent I/O failure
    #[error("{stage} backing store unavailable: {message}")]
    BackingStoreUnavailable { stage: Stage, message: String },

    /// Semantic index could not embed or index an entry
    #[error("Semantic index degraded: {0}")]
    IndexDegraded(String),

    /// Optimistic write against a stale persistent version
    #[error("Version conflict on {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u32,
        actual: u32,
    },

    /// Timeout during a tier operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed TOML configuration
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backing store error for a tier.
    pub fn backing_store(stage: Stage, message: impl Into<String>) -> Self {
        Self::BackingStoreUnavailable {
            stage,
            message: message.into(),
        }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(size: usize, capacity: usize) -> Self {
        Self::CapacityExceeded { size, capacity }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a version conflict error.
    pub fn version_conflict(id: impl Into<String>, expected: u32, actual: u32) -> Self {
        Self::VersionConflict {
            id: id.into(),
            expected,
            actual,
        }
    }

    /// Whether the error came from a tier's storage engine.
    pub fn is_backing_store(&self) -> bool {
        matches!(self, Self::BackingStoreUnavailable { .. })
    }
}
