// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Clause evaluation.
//!
//! Replica clauses count replicas per scope bucket (collection, and shard
//! when the clause is `#EACH` or names a shard) over the live rows selected
//! by the clause's tag. Wildcard tags partition those rows by tag value, so
//! `node: #ANY` counts per node and `sysprop.rack: #ANY` per rack; any other
//! tag forms a single group. Node-attribute clauses are checked row by row.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::clause::{Clause, ShardScope};
use crate::operand::{Condition, Operand};
use crate::row::{ReplicaInfo, Row};
use crate::value::TagValue;

/// Collections and their shards visible to an evaluation.
pub type Scopes = BTreeMap<String, BTreeSet<String>>;

/// A breach of one clause in one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    clause: Arc<Clause>,
    collection: Option<String>,
    shard: Option<String>,
    node: Option<String>,
    group: Option<TagValue>,
    actual: f64,
    delta: f64,
    replicas: Vec<ReplicaInfo>,
}

impl Violation {
    /// The violated clause.
    #[must_use]
    pub fn clause(&self) -> &Arc<Clause> {
        &self.clause
    }

    /// Collection of the breached scope; `None` for node-attribute clauses.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Shard of the breached scope, when the clause is evaluated per shard.
    #[must_use]
    pub fn shard(&self) -> Option<&str> {
        self.shard.as_deref()
    }

    /// Node, when the breach concerns a single node.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Tag value shared by the violating group of a wildcard clause.
    #[must_use]
    pub fn tag_value(&self) -> Option<&TagValue> {
        self.group.as_ref()
    }

    /// Observed replica count, or attribute value for node-attribute clauses.
    #[must_use]
    pub fn actual(&self) -> f64 {
        self.actual
    }

    /// The condition that failed.
    #[must_use]
    pub fn expected(&self) -> &Condition {
        self.clause.replica().unwrap_or_else(|| self.clause.tag())
    }

    /// Signed distance to compliance: positive means too many replicas (or
    /// too high a value), negative means too few.
    #[must_use]
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Replicas contributing to an excess; empty when the scope has too few.
    #[must_use]
    pub fn replicas(&self) -> &[ReplicaInfo] {
        &self.replicas
    }

    /// Whether the violated clause is strict.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.clause.is_strict()
    }

    /// Returns true if both violations concern the same clause and scope.
    #[must_use]
    pub fn same_scope(&self, other: &Violation) -> bool {
        (Arc::ptr_eq(&self.clause, &other.clause) || self.clause == other.clause)
            && self.collection == other.collection
            && self.shard == other.shard
            && self.node == other.node
            && self.group == other.group
    }

    /// Renders the violation for reporting.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "clause": self.clause.to_json(),
            "collection": self.collection,
            "shard": self.shard,
            "node": self.node,
            "tagValue": self.group.as_ref().map(TagValue::to_json),
            "actual": self.actual,
            "expected": self.expected().to_string(),
            "delta": self.delta,
            "strict": self.is_strict(),
            "replicas": self.replicas.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        })
    }
}

/// Collections and shards hosted on live rows.
#[must_use]
pub fn observed_scopes(rows: &[Arc<Row>]) -> Scopes {
    let mut scopes = Scopes::new();
    for row in rows.iter().filter(|r| r.is_live()) {
        for (collection, shards) in row.replicas() {
            scopes.entry(collection.clone()).or_default().extend(shards.keys().cloned());
        }
    }
    scopes
}

/// Evaluates one clause over `rows`, within `scopes` for replica clauses.
#[must_use]
pub fn evaluate(clause: &Arc<Clause>, rows: &[Arc<Row>], scopes: &Scopes) -> Vec<Violation> {
    let Some(replica) = clause.replica() else {
        return evaluate_node_attribute(clause, rows);
    };

    let mut violations = Vec::new();
    for (collection, shards) in scopes.iter().filter(|(c, _)| clause.applies_to_collection(c)) {
        let buckets: Vec<Option<&str>> = match clause.shard() {
            ShardScope::Any => vec![None],
            ShardScope::Each => shards.iter().map(|s| Some(s.as_str())).collect(),
            ShardScope::Named(name) => vec![Some(name.as_str())],
        };
        for shard in buckets {
            evaluate_bucket(clause, replica, rows, collection, shard, &mut violations);
        }
    }
    violations
}

#[derive(Default)]
struct Group {
    value: Option<TagValue>,
    nodes: Vec<String>,
    count: usize,
    replicas: Vec<ReplicaInfo>,
}

fn evaluate_bucket(
    clause: &Arc<Clause>,
    replica: &Condition,
    rows: &[Arc<Row>],
    collection: &str,
    shard: Option<&str>,
    out: &mut Vec<Violation>,
) {
    let tag = clause.tag();
    let partitioned = tag.operand() == Operand::Wildcard;
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for row in rows.iter().filter(|r| r.is_live()) {
        let value = row.tag(tag.name());
        if !tag.is_pass(value) {
            continue;
        }
        let key = if partitioned { value.map(ToString::to_string).unwrap_or_default() } else { String::new() };
        let group = groups.entry(key).or_insert_with(|| Group {
            value: if partitioned { value.cloned() } else { None },
            ..Group::default()
        });
        let hosted: Vec<&ReplicaInfo> =
            row.replicas_matching(collection, shard, clause.replica_type()).collect();
        group.count += hosted.len();
        group.replicas.extend(hosted.into_iter().cloned());
        group.nodes.push(row.node().to_string());
    }

    for group in groups.into_values() {
        let actual = group.count as f64;
        if replica.is_pass_count(actual) {
            continue;
        }
        let delta = replica.delta(actual);
        out.push(Violation {
            clause: Arc::clone(clause),
            collection: Some(collection.to_string()),
            shard: shard.map(str::to_string),
            node: match group.nodes.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            },
            group: group.value,
            actual,
            delta,
            replicas: if delta > 0.0 { group.replicas } else { Vec::new() },
        });
    }
}

fn evaluate_node_attribute(clause: &Arc<Clause>, rows: &[Arc<Row>]) -> Vec<Violation> {
    let tag = clause.tag();
    rows.iter()
        .filter(|r| r.is_live())
        .filter(|r| clause.node_filter().map_or(true, |f| f.is_pass(r.tag("node"))))
        .filter_map(|row| {
            let value = row.tag(tag.name())?;
            if tag.is_pass(Some(value)) {
                return None;
            }
            let actual = value.as_f64();
            Some(Violation {
                clause: Arc::clone(clause),
                collection: None,
                shard: None,
                node: Some(row.node().to_string()),
                group: None,
                actual: actual.unwrap_or(0.0),
                delta: actual.map_or(1.0, |a| tag.delta(a)),
                replicas: row.iter_replicas().cloned().collect(),
            })
        })
        .collect()
}

/// Returns true if `after` contains a violation that is absent from `before`
/// or worse than its counterpart there.
#[must_use]
pub fn introduces_violation(before: &[Violation], after: &[Violation], strict_only: bool) -> bool {
    after.iter().filter(|v| !strict_only || v.is_strict()).any(|v| {
        before
            .iter()
            .find(|b| b.same_scope(v))
            .map_or(true, |previous| v.delta.abs() > previous.delta.abs())
    })
}

/// Returns true if `target` is gone from `after` or got closer to compliance.
#[must_use]
pub fn improves(target: &Violation, after: &[Violation]) -> bool {
    after
        .iter()
        .find(|v| v.same_scope(target))
        .map_or(true, |v| v.delta.abs() < target.delta.abs())
}
