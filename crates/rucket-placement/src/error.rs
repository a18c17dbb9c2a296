// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Error types for policy parsing, placement and provider access.

use thiserror::Error;

use crate::row::ReplicaType;

/// Boxed error returned by cluster and node state providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur while building or applying a placement policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A clause or attribute value is malformed or out of range.
    #[error("Invalid value for '{name}': {message}")]
    Validation {
        /// Attribute name.
        name: String,
        /// What is wrong with the value.
        message: String,
    },

    /// The policy document does not have the expected shape.
    #[error("Malformed policy document: {0}")]
    Document(String),

    /// A required replica could not be placed on any node.
    #[error("Cannot place {replica_type} replica of {collection}/{shard}: {reason}")]
    Placement {
        /// Collection being placed.
        collection: String,
        /// Shard being placed.
        shard: String,
        /// Requested replica type.
        replica_type: ReplicaType,
        /// Why no node qualified.
        reason: String,
    },

    /// A state provider failed; the provider's error is passed through.
    #[error("State provider error: {0}")]
    Provider(#[source] BoxError),

    /// Engine configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PolicyError {
    /// Creates a validation error.
    pub fn validation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { name: name.into(), message: message.into() }
    }

    /// Returns true if this error was raised while validating a value.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = PolicyError::validation("port", "0 must be greater than or equal to 1");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Invalid value for 'port': 0 must be greater than or equal to 1"
        );
    }

    #[test]
    fn test_provider_error_keeps_source() {
        let inner: BoxError = "zookeeper unavailable".into();
        let err = PolicyError::Provider(inner);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("zookeeper unavailable"));
    }

    #[test]
    fn test_placement_display() {
        let err = PolicyError::Placement {
            collection: "c1".to_string(),
            shard: "s1".to_string(),
            replica_type: ReplicaType::Pull,
            reason: "no eligible node".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot place PULL replica of c1/s1: no eligible node");
    }
}
