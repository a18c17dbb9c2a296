// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement clauses.
//!
//! A clause is parsed once from an attribute-bag object such as
//! `{"replica": "<2", "shard": "#EACH", "node": "#ANY"}` into a typed record.
//! Two shapes exist:
//!
//! - **Replica clauses** carry a `replica` condition and exactly one tag
//!   condition. They bound how many replicas of a collection (or shard) may
//!   sit on the nodes selected by the tag.
//! - **Node-attribute clauses** have no `replica` key and constrain a node
//!   attribute directly, e.g. `{"cores": "<10", "node": "#ANY"}`.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::{PolicyError, Result};
use crate::operand::{Condition, Operand, ANY, EACH};
use crate::row::ReplicaType;

const RESERVED: [&str; 5] = ["replica", "shard", "collection", "type", "strict"];

/// Which collections a clause applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionScope {
    /// Every collection.
    Any,
    /// A single collection.
    Named(String),
}

impl CollectionScope {
    /// Returns true if the scope covers `collection`.
    #[must_use]
    pub fn matches(&self, collection: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => name == collection,
        }
    }
}

/// How a clause partitions shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardScope {
    /// Aggregate all shards of the collection.
    Any,
    /// Evaluate each shard independently.
    Each,
    /// A single shard.
    Named(String),
}

impl ShardScope {
    /// Returns true if the scope covers `shard`.
    #[must_use]
    pub fn matches(&self, shard: &str) -> bool {
        match self {
            Self::Any | Self::Each => true,
            Self::Named(name) => name == shard,
        }
    }
}

/// A single placement constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    original: Map<String, Value>,
    tag: Condition,
    replica: Option<Condition>,
    node_filter: Option<Condition>,
    collection: CollectionScope,
    shard: ShardScope,
    replica_type: Option<ReplicaType>,
    strict: bool,
}

impl Clause {
    /// Parses a clause from its document object.
    ///
    /// # Errors
    ///
    /// Returns a validation error for out-of-range values and a document
    /// error when the clause does not have exactly one tag condition.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let strict = match map.get("strict") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) if s == "true" || s == "false" => s == "true",
            Some(other) => {
                return Err(PolicyError::validation(
                    "strict",
                    format!("'{other}' must be one of [true, false]"),
                ))
            }
        };

        let collection = match map.get("collection") {
            None => CollectionScope::Any,
            Some(Value::String(s)) if s == ANY => CollectionScope::Any,
            Some(Value::String(s)) => CollectionScope::Named(s.clone()),
            Some(other) => {
                return Err(PolicyError::validation(
                    "collection",
                    format!("{other} is not a collection name"),
                ))
            }
        };

        let shard = match map.get("shard") {
            None => ShardScope::Any,
            Some(Value::String(s)) if s == ANY => ShardScope::Any,
            Some(Value::String(s)) if s == EACH => ShardScope::Each,
            Some(Value::String(s)) => ShardScope::Named(s.clone()),
            Some(other) => {
                return Err(PolicyError::validation("shard", format!("{other} is not a shard name")))
            }
        };

        let replica_type = match map.get("type") {
            None => None,
            Some(Value::String(s)) => Some(s.parse::<ReplicaType>()?),
            Some(other) => {
                return Err(PolicyError::validation(
                    "type",
                    format!("'{other}' must be one of [\"NRT\", \"TLOG\", \"PULL\"]"),
                ))
            }
        };

        let replica = map.get("replica").map(|v| Condition::parse("replica", v)).transpose()?;
        let tags: Vec<(&String, &Value)> =
            map.iter().filter(|(k, _)| !RESERVED.contains(&k.as_str())).collect();

        let (tag, node_filter) = if replica.is_some() {
            match tags.as_slice() {
                [(name, raw)] => (Condition::parse(name, raw)?, None),
                [] => return Err(document_error(map, "has no tag condition")),
                _ => return Err(document_error(map, "has more than one tag condition")),
            }
        } else {
            if !matches!(shard, ShardScope::Any) || replica_type.is_some() {
                return Err(document_error(map, "scopes a node attribute by shard or type"));
            }
            let node = map.get("node").map(|v| Condition::parse("node", v)).transpose()?;
            let attributes: Vec<_> = tags.iter().filter(|(k, _)| k.as_str() != "node").collect();
            match attributes.as_slice() {
                [(name, raw)] => (Condition::parse(name, raw)?, node),
                [] => return Err(document_error(map, "has neither a replica nor an attribute condition")),
                _ => return Err(document_error(map, "has more than one attribute condition")),
            }
        };

        Ok(Self {
            original: map.clone(),
            tag,
            replica,
            node_filter,
            collection,
            shard,
            replica_type,
            strict,
        })
    }

    /// Parses a clause from a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns a document error for non-objects, otherwise as [`Clause::from_map`].
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(PolicyError::Document(format!("clause must be an object, got {other}"))),
        }
    }

    /// The tag (or node attribute) condition.
    #[must_use]
    pub fn tag(&self) -> &Condition {
        &self.tag
    }

    /// The replica-count condition; `None` for node-attribute clauses.
    #[must_use]
    pub fn replica(&self) -> Option<&Condition> {
        self.replica.as_ref()
    }

    /// Node filter of a node-attribute clause.
    #[must_use]
    pub fn node_filter(&self) -> Option<&Condition> {
        self.node_filter.as_ref()
    }

    /// Collection scope.
    #[must_use]
    pub fn collection(&self) -> &CollectionScope {
        &self.collection
    }

    /// Shard scope.
    #[must_use]
    pub fn shard(&self) -> &ShardScope {
        &self.shard
    }

    /// Replica type filter.
    #[must_use]
    pub fn replica_type(&self) -> Option<ReplicaType> {
        self.replica_type
    }

    /// Whether violations of this clause block placements.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Returns true for clauses that constrain a node attribute directly.
    #[must_use]
    pub fn is_node_attribute(&self) -> bool {
        self.replica.is_none()
    }

    /// Returns true if the clause asks for an exact positive number of
    /// replicas on nodes selected by a concrete tag.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        let exact_positive = self.replica.as_ref().is_some_and(|r| {
            r.operand() == Operand::Equal && r.bound().is_some_and(|b| b > 0.0)
        });
        exact_positive && !matches!(self.tag.operand(), Operand::Wildcard | Operand::NotEqual)
    }

    /// Returns true for `{replica: 0, tag: "!value"}` style clauses.
    #[must_use]
    pub fn is_exclusion(&self) -> bool {
        self.tag.operand() == Operand::NotEqual
            && self.replica.as_ref().is_some_and(|r| {
                r.operand() == Operand::Equal && r.bound() == Some(0.0)
            })
    }

    /// Returns true if matching nodes may not host any replica in scope.
    #[must_use]
    pub fn forbids_hosting(&self) -> bool {
        self.strict && self.replica.as_ref().and_then(Condition::max_allowed) == Some(0.0)
    }

    /// Returns true if the clause constrains replicas of `collection`.
    #[must_use]
    pub fn applies_to_collection(&self, collection: &str) -> bool {
        self.collection.matches(collection)
    }

    /// Returns true if the clause constrains a replica of the given scope.
    #[must_use]
    pub fn applies_to(&self, collection: &str, shard: &str, replica_type: ReplicaType) -> bool {
        !self.is_node_attribute()
            && self.collection.matches(collection)
            && self.shard.matches(shard)
            && self.replica_type.map_or(true, |t| t == replica_type)
    }

    /// Returns a copy bound to `collection` if the clause applies to any
    /// collection. Node-attribute clauses are returned unchanged.
    #[must_use]
    pub fn for_collection(&self, collection: &str) -> Clause {
        let mut clause = self.clone();
        if !clause.is_node_attribute() && clause.collection == CollectionScope::Any {
            clause.collection = CollectionScope::Named(collection.to_string());
            clause.original.insert("collection".to_string(), Value::from(collection));
        }
        clause
    }

    /// Returns true if this clause replaces `other` when merging a collection
    /// policy over the cluster policy.
    #[must_use]
    pub fn overrides(&self, other: &Clause) -> bool {
        self.is_node_attribute() == other.is_node_attribute()
            && self.collection == other.collection
            && self.tag.name() == other.tag.name()
    }

    /// The original document object.
    #[must_use]
    pub fn original(&self) -> &Map<String, Value> {
        &self.original
    }

    /// Renders the clause back to its document form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.original.clone())
    }

    /// Total evaluation order: more specific and harder-to-satisfy clauses
    /// come first.
    ///
    /// Clauses of equal priority are ordered by their tag condition, replica
    /// type and strictness, and finally by their document form, so only
    /// identical clauses compare equal.
    #[must_use]
    pub fn priority_cmp(&self, other: &Clause) -> Ordering {
        self.tag
            .operand()
            .priority()
            .cmp(&other.tag.operand().priority())
            .then_with(|| self.replica_priority().cmp(&other.replica_priority()))
            .then_with(|| other.replica_bound().total_cmp(&self.replica_bound()))
            .then_with(|| self.scope_rank().cmp(&other.scope_rank()))
            .then_with(|| self.tag.name().cmp(other.tag.name()))
            .then_with(|| self.tag.to_string().cmp(&other.tag.to_string()))
            .then_with(|| self.replica_type.cmp(&other.replica_type))
            .then_with(|| other.strict.cmp(&self.strict))
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }

    fn replica_priority(&self) -> u32 {
        self.replica.as_ref().map_or(Operand::Wildcard, Condition::operand).priority()
    }

    fn replica_bound(&self) -> f64 {
        self.replica.as_ref().and_then(Condition::bound).unwrap_or(f64::NEG_INFINITY)
    }

    fn scope_rank(&self) -> u8 {
        let collection = match self.collection {
            CollectionScope::Named(_) => 0,
            CollectionScope::Any => 1,
        };
        let shard = match self.shard {
            ShardScope::Named(_) => 0,
            ShardScope::Each => 1,
            ShardScope::Any => 2,
        };
        collection + shard
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.original.clone()))
    }
}

/// Sorts clauses by [`Clause::priority_cmp`].
pub fn sort_clauses(clauses: &mut [Clause]) {
    clauses.sort_by(Clause::priority_cmp);
}

fn document_error(map: &Map<String, Value>, problem: &str) -> PolicyError {
    PolicyError::Document(format!("clause {} {problem}", Value::Object(map.clone())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn clause(value: Value) -> Clause {
        Clause::from_json(&value).unwrap()
    }

    #[test]
    fn test_parse_replica_clause() {
        let c = clause(json!({"replica": "<2", "shard": "#EACH", "node": "#ANY"}));
        assert_eq!(c.tag().name(), "node");
        assert_eq!(c.tag().operand(), Operand::Wildcard);
        assert_eq!(c.shard(), &ShardScope::Each);
        assert_eq!(c.collection(), &CollectionScope::Any);
        assert!(c.is_strict());
        assert!(!c.is_node_attribute());
        assert!(!c.is_greedy());
    }

    #[test]
    fn test_parse_node_attribute_clause() {
        let c = clause(json!({"cores": "<10", "node": "#ANY"}));
        assert!(c.is_node_attribute());
        assert_eq!(c.tag().name(), "cores");
        assert_eq!(c.node_filter().map(Condition::operand), Some(Operand::Wildcard));
        assert!(!c.forbids_hosting());
    }

    #[test]
    fn test_classification() {
        let greedy = clause(json!({"replica": 2, "shard": "#EACH", "sysprop.fs": "ssd", "type": "TLOG"}));
        assert!(greedy.is_greedy());
        assert_eq!(greedy.replica_type(), Some(ReplicaType::Tlog));

        let exclusion = clause(json!({"replica": 0, "sysprop.fs": "!ssd", "type": "PULL"}));
        assert!(exclusion.is_exclusion());
        assert!(exclusion.forbids_hosting());

        let overseer = clause(json!({"replica": 0, "nodeRole": "overseer"}));
        assert!(!overseer.is_exclusion());
        assert!(overseer.forbids_hosting());

        let advisory = clause(json!({"replica": "<1", "nodeRole": "overseer", "strict": false}));
        assert!(!advisory.is_strict());
        assert!(!advisory.forbids_hosting());
    }

    #[test]
    fn test_invalid_clauses() {
        assert!(Clause::from_json(&json!({"replica": -1, "node": "#ANY"})).is_err());
        assert!(Clause::from_json(&json!({"replica": 1})).is_err());
        assert!(Clause::from_json(&json!({"replica": 1, "node": "#ANY", "sysprop.rack": "r1"})).is_err());
        assert!(Clause::from_json(&json!({"replica": 1, "nodeRole": "wrong"})).is_err());
        assert!(Clause::from_json(&json!({"cores": "<10", "shard": "#EACH"})).is_err());
        assert!(Clause::from_json(&json!({"replica": 1, "node": "#ANY", "strict": "maybe"})).is_err());
        assert!(Clause::from_json(&json!(["replica"])).is_err());
    }

    #[test]
    fn test_applies_to() {
        let c = clause(json!({"replica": 0, "sysprop.fs": "!ssd", "type": "PULL", "shard": "s1"}));
        assert!(c.applies_to("any", "s1", ReplicaType::Pull));
        assert!(!c.applies_to("any", "s2", ReplicaType::Pull));
        assert!(!c.applies_to("any", "s1", ReplicaType::Nrt));

        let bound = c.for_collection("c1");
        assert!(bound.applies_to("c1", "s1", ReplicaType::Pull));
        assert!(!bound.applies_to("c2", "s1", ReplicaType::Pull));
        assert_eq!(bound.original().get("collection"), Some(&json!("c1")));
    }

    #[test]
    fn test_conditions_sort() {
        let mut clauses = vec![
            clause(json!({"replica": "0", "nodeRole": "overseer", "strict": false})),
            clause(json!({"replica": "<2", "node": "#ANY", "shard": "#EACH"})),
            clause(json!({"replica": 1, "sysprop.rack": "rack1", "shard": "#EACH"})),
        ];
        sort_clauses(&mut clauses);
        let names: Vec<&str> = clauses.iter().map(|c| c.tag().name()).collect();
        assert_eq!(names, vec!["sysprop.rack", "nodeRole", "node"]);
    }

    #[test]
    fn test_sort_breaks_ties_on_tag_value() {
        let ssd = clause(json!({"replica": 0, "shard": "#EACH", "sysprop.fs": "!ssd", "type": "TLOG"}));
        let slow = clause(json!({"replica": 0, "shard": "#EACH", "sysprop.fs": "!slowdisk", "type": "PULL"}));
        assert_ne!(ssd.priority_cmp(&slow), Ordering::Equal);
        assert_eq!(ssd.priority_cmp(&slow), slow.priority_cmp(&ssd).reverse());

        let mut forward = vec![ssd.clone(), slow.clone()];
        let mut reverse = vec![slow, ssd];
        sort_clauses(&mut forward);
        sort_clauses(&mut reverse);
        let forward: Vec<Value> = forward.iter().map(Clause::to_json).collect();
        let reverse: Vec<Value> = reverse.iter().map(Clause::to_json).collect();
        assert_eq!(forward, reverse);
        assert_eq!(forward[0]["sysprop.fs"], json!("!slowdisk"));
    }

    #[test]
    fn test_sort_breaks_ties_on_type_and_strictness() {
        let tlog = clause(json!({"replica": "<2", "node": "#ANY", "type": "TLOG"}));
        let nrt = clause(json!({"replica": "<2", "node": "#ANY", "type": "NRT"}));
        let advisory = clause(json!({"replica": "<2", "node": "#ANY", "type": "NRT", "strict": false}));
        for mut clauses in [
            vec![tlog.clone(), nrt.clone(), advisory.clone()],
            vec![advisory.clone(), tlog.clone(), nrt.clone()],
            vec![nrt.clone(), advisory.clone(), tlog.clone()],
        ] {
            sort_clauses(&mut clauses);
            assert_eq!(clauses[0].replica_type(), Some(ReplicaType::Nrt));
            assert!(clauses[0].is_strict());
            assert!(!clauses[1].is_strict());
            assert_eq!(clauses[2].replica_type(), Some(ReplicaType::Tlog));
        }
    }

    #[test]
    fn test_round_trip_original() {
        let raw = json!({"replica": "<2", "shard": "#EACH", "node": "#ANY", "strict": false});
        assert_eq!(clause(raw.clone()).to_json(), raw);
    }

    #[test]
    fn test_overrides() {
        let coll = clause(json!({"replica": "<2", "shard": "#ANY", "node": "#ANY"})).for_collection("c1");
        let cluster = clause(json!({"replica": "<2", "shard": "#EACH", "node": "#ANY"})).for_collection("c1");
        let other = clause(json!({"replica": 0, "nodeRole": "overseer"})).for_collection("c1");
        assert!(coll.overrides(&cluster));
        assert!(!coll.overrides(&other));
    }
}
