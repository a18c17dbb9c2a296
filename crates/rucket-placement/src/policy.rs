// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Policy documents.
//!
//! A policy is read from a JSON document of the form:
//!
//! ```json
//! {
//!   "cluster-policy": [{"replica": "<2", "shard": "#EACH", "node": "#ANY"}],
//!   "cluster-preferences": [{"minimize": "cores", "precision": 3}],
//!   "policies": {"p1": [{"replica": 0, "nodeRole": "overseer"}]}
//! }
//! ```
//!
//! Cluster clauses apply to every collection; named policies are attached to
//! collections by the cluster state provider and are merged over the cluster
//! clauses at evaluation time.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::warn;

use crate::clause::{sort_clauses, Clause};
use crate::error::{PolicyError, Result};
use crate::preference::Preference;

const CLUSTER_POLICY: &str = "cluster-policy";
const CLUSTER_PREFERENCES: &str = "cluster-preferences";
const POLICIES: &str = "policies";

/// A parsed placement policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    cluster_clauses: Vec<Clause>,
    policies: BTreeMap<String, Vec<Clause>>,
    preferences: Vec<Preference>,
    sections: BTreeSet<&'static str>,
    extra: Map<String, Value>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cluster_clauses: Vec::new(),
            policies: BTreeMap::new(),
            preferences: vec![Preference::minimize("cores")],
            sections: BTreeSet::new(),
            extra: Map::new(),
        }
    }
}

impl Policy {
    /// Parses a policy from JSON text.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for malformed text, otherwise as [`Policy::from_json`].
    pub fn parse(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        Self::from_json(&document)
    }

    /// Parses a policy document.
    ///
    /// # Errors
    ///
    /// Returns a document error if a section has the wrong shape and a
    /// validation error if any clause value is invalid.
    pub fn from_json(document: &Value) -> Result<Self> {
        let Value::Object(map) = document else {
            return Err(PolicyError::Document(format!("policy must be an object, got {document}")));
        };

        let mut policy = Self::default();
        for (key, value) in map {
            match key.as_str() {
                CLUSTER_POLICY => {
                    policy.cluster_clauses = parse_clauses(key, value)?;
                    policy.sections.insert(CLUSTER_POLICY);
                }
                CLUSTER_PREFERENCES => {
                    let items = as_array(key, value)?;
                    policy.preferences =
                        items.iter().map(Preference::from_json).collect::<Result<Vec<_>>>()?;
                    policy.sections.insert(CLUSTER_PREFERENCES);
                }
                POLICIES => {
                    let Value::Object(named) = value else {
                        return Err(PolicyError::Document(format!("'{POLICIES}' must be an object")));
                    };
                    for (name, clauses) in named {
                        policy.policies.insert(name.clone(), parse_clauses(name, clauses)?);
                    }
                    policy.sections.insert(POLICIES);
                }
                _ => {
                    policy.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(policy)
    }

    /// Renders the policy back to its document form.
    ///
    /// Sections are emitted when they were present in the parsed document or
    /// set through a builder, so documents round-trip unchanged.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = self.extra.clone();
        if self.sections.contains(CLUSTER_POLICY) {
            map.insert(
                CLUSTER_POLICY.to_string(),
                Value::Array(self.cluster_clauses.iter().map(Clause::to_json).collect()),
            );
        }
        if self.sections.contains(CLUSTER_PREFERENCES) {
            map.insert(
                CLUSTER_PREFERENCES.to_string(),
                Value::Array(self.preferences.iter().map(Preference::to_json).collect()),
            );
        }
        if self.sections.contains(POLICIES) {
            let named: Map<String, Value> = self
                .policies
                .iter()
                .map(|(name, clauses)| {
                    (name.clone(), Value::Array(clauses.iter().map(Clause::to_json).collect()))
                })
                .collect();
            map.insert(POLICIES.to_string(), Value::Object(named));
        }
        Value::Object(map)
    }

    /// Replaces the cluster clauses.
    #[must_use]
    pub fn with_cluster_clauses(mut self, clauses: Vec<Clause>) -> Self {
        self.cluster_clauses = clauses;
        self.sections.insert(CLUSTER_POLICY);
        self
    }

    /// Adds or replaces a named collection policy.
    #[must_use]
    pub fn with_policy(mut self, name: impl Into<String>, clauses: Vec<Clause>) -> Self {
        self.policies.insert(name.into(), clauses);
        self.sections.insert(POLICIES);
        self
    }

    /// Replaces the preferences.
    #[must_use]
    pub fn with_preferences(mut self, preferences: Vec<Preference>) -> Self {
        self.preferences = preferences;
        self.sections.insert(CLUSTER_PREFERENCES);
        self
    }

    /// Clauses applying to every collection, in document order.
    #[must_use]
    pub fn cluster_clauses(&self) -> &[Clause] {
        &self.cluster_clauses
    }

    /// Named collection policies.
    #[must_use]
    pub fn policies(&self) -> &BTreeMap<String, Vec<Clause>> {
        &self.policies
    }

    /// Preferences in significance order.
    #[must_use]
    pub fn preferences(&self) -> &[Preference] {
        &self.preferences
    }

    /// Returns the sorted clause list for `collection`, merging the named
    /// collection policy (if any) over the cluster clauses.
    #[must_use]
    pub fn merged_clauses(&self, collection: &str, policy_name: Option<&str>) -> Vec<Clause> {
        let collection_clauses = match policy_name {
            None => &[][..],
            Some(name) => match self.policies.get(name) {
                Some(clauses) => clauses.as_slice(),
                None => {
                    warn!(policy = name, collection, "Unknown collection policy, using cluster policy");
                    &[][..]
                }
            },
        };
        Self::merge(collection, collection_clauses, &self.cluster_clauses)
    }

    /// Merges collection clauses over cluster clauses for `collection`.
    ///
    /// Collection clauses come first; a cluster clause is dropped when a
    /// collection clause overrides it. Clauses bound to another collection
    /// are dropped. The result is sorted by clause priority.
    #[must_use]
    pub fn merge(collection: &str, collection_clauses: &[Clause], cluster_clauses: &[Clause]) -> Vec<Clause> {
        let mut merged: Vec<Clause> = collection_clauses
            .iter()
            .filter(|c| c.applies_to_collection(collection))
            .map(|c| c.for_collection(collection))
            .collect();
        let inherited: Vec<Clause> = cluster_clauses
            .iter()
            .filter(|c| c.applies_to_collection(collection))
            .map(|c| c.for_collection(collection))
            .filter(|c| !merged.iter().any(|m| m.overrides(c)))
            .collect();
        merged.extend(inherited);
        sort_clauses(&mut merged);
        merged
    }

    /// Node attributes referenced by any clause or preference. These are the
    /// only values a session fetches from nodes.
    #[must_use]
    pub fn attribute_names(&self) -> BTreeSet<String> {
        let clauses = self.cluster_clauses.iter().chain(self.policies.values().flatten());
        clauses
            .map(|c| c.tag().name().to_string())
            .chain(self.preferences.iter().map(|p| p.name().to_string()))
            .filter(|name| !matches!(name.as_str(), "node" | "collection" | "shard" | "replica" | "type"))
            .collect()
    }
}

fn as_array<'a>(key: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| PolicyError::Document(format!("'{key}' must be an array")))
}

fn parse_clauses(key: &str, value: &Value) -> Result<Vec<Clause>> {
    as_array(key, value)?.iter().map(Clause::from_json).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_round_trip() {
        let document = json!({
            "cluster-policy": [
                {"replica": "<2", "shard": "#EACH", "node": "#ANY"},
                {"replica": 0, "nodeRole": "overseer"}
            ],
            "cluster-preferences": [
                {"minimize": "cores", "precision": 3},
                {"maximize": "freedisk"}
            ],
            "policies": {
                "p1": [{"replica": 1, "sysprop.fs": "ssd", "shard": "#EACH"}]
            }
        });
        let policy = Policy::from_json(&document).unwrap();
        assert_eq!(policy.cluster_clauses().len(), 2);
        assert_eq!(policy.preferences().len(), 2);
        assert_eq!(policy.to_json(), document);
    }

    #[test]
    fn test_default_preference() {
        let policy = Policy::parse(r#"{"cluster-policy": []}"#).unwrap();
        assert_eq!(policy.preferences(), &[Preference::minimize("cores")]);
        assert_eq!(policy.to_json(), json!({"cluster-policy": []}));

        let unordered = Policy::parse(r#"{"cluster-preferences": [], "x-owner": "ops"}"#).unwrap();
        assert!(unordered.preferences().is_empty());
        assert_eq!(unordered.to_json(), json!({"cluster-preferences": [], "x-owner": "ops"}));
    }

    #[test]
    fn test_merge_order() {
        let policy = Policy::from_json(&json!({
            "cluster-policy": [
                {"replica": "<2", "shard": "#EACH", "node": "#ANY"},
                {"replica": "<2", "shard": "#EACH", "sysprop.rack": "rack1"},
                {"replica": 0, "nodeRole": "overseer"}
            ],
            "policies": {
                "policy1": [
                    {"replica": "<2", "shard": "#ANY", "node": "#ANY"},
                    {"replica": 1, "sysprop.fs": "ssd", "shard": "#EACH"}
                ]
            }
        }))
        .unwrap();

        let merged = policy.merged_clauses("mycoll", Some("policy1"));
        let rendered: Vec<Value> = merged.iter().map(Clause::to_json).collect();
        assert_eq!(
            rendered,
            vec![
                json!({"replica": 1, "sysprop.fs": "ssd", "shard": "#EACH", "collection": "mycoll"}),
                json!({"replica": 0, "nodeRole": "overseer", "collection": "mycoll"}),
                json!({"replica": "<2", "shard": "#EACH", "sysprop.rack": "rack1", "collection": "mycoll"}),
                json!({"replica": "<2", "shard": "#ANY", "node": "#ANY", "collection": "mycoll"}),
            ]
        );
    }

    #[test]
    fn test_unknown_policy_falls_back() {
        let policy = Policy::from_json(&json!({
            "cluster-policy": [{"replica": 0, "nodeRole": "overseer"}]
        }))
        .unwrap();
        assert_eq!(policy.merged_clauses("c1", Some("missing")).len(), 1);
    }

    #[test]
    fn test_other_collection_clauses_dropped() {
        let policy = Policy::from_json(&json!({
            "cluster-policy": [
                {"replica": 0, "nodeRole": "overseer", "collection": "other"},
                {"cores": "<10", "node": "#ANY"}
            ]
        }))
        .unwrap();
        let merged = policy.merged_clauses("c1", None);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_node_attribute());
    }

    #[test]
    fn test_attribute_names() {
        let policy = Policy::from_json(&json!({
            "cluster-policy": [
                {"replica": "<2", "shard": "#EACH", "node": "#ANY"},
                {"replica": 0, "nodeRole": "overseer"}
            ],
            "cluster-preferences": [{"maximize": "freedisk"}],
            "policies": {"p1": [{"replica": 1, "sysprop.fs": "ssd"}]}
        }))
        .unwrap();
        let names: Vec<String> = policy.attribute_names().into_iter().collect();
        assert_eq!(names, vec!["freedisk", "nodeRole", "sysprop.fs"]);
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(Policy::parse("[]"), Err(PolicyError::Document(_))));
        assert!(matches!(Policy::parse("{"), Err(PolicyError::Json(_))));
        assert!(Policy::parse(r#"{"cluster-policy": {}}"#).is_err());
        assert!(Policy::parse(r#"{"policies": []}"#).is_err());
        assert!(Policy::parse(r##"{"cluster-policy": [{"replica": "hello", "node": "#ANY"}]}"##)
            .unwrap_err()
            .is_validation());
    }
}
