// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};

/// Tuning knobs for suggestion batches.
///
/// ```toml
/// max_suggestions = 100
/// max_moves_per_violation = 32
/// include_advisory = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of suggestions returned by one batch.
    pub max_suggestions: usize,
    /// Maximum chained moves attempted for a single violation.
    pub max_moves_per_violation: usize,
    /// Whether violations of advisory (`strict: false`) clauses are reported
    /// and worked on.
    pub include_advisory: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_suggestions: 100, max_moves_per_violation: 32, include_advisory: true }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PolicyError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_suggestions, 100);
        assert_eq!(config.max_moves_per_violation, 32);
        assert!(config.include_advisory);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::parse("include_advisory = false").unwrap();
        assert!(!config.include_advisory);
        assert_eq!(config.max_suggestions, 100);
    }

    #[test]
    fn test_invalid_toml() {
        let err = EngineConfig::parse("max_suggestions = \"many\"").unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_suggestions = 5\nmax_moves_per_violation = 2").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_suggestions, 5);
        assert_eq!(config.max_moves_per_violation, 2);

        let missing = EngineConfig::from_file(Path::new("/nonexistent/placement.toml"));
        assert!(matches!(missing, Err(PolicyError::Io(_))));
    }
}
