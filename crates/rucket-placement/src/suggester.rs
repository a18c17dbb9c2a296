// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement search.
//!
//! A [`Suggester`] produces at most one operation per call, together with the
//! session that would result from applying it. Callers chain suggestions by
//! asking the resulting session for the next one.
//!
//! Candidates are simulated on copied rows and re-evaluated against the
//! clauses of the affected collection. A candidate is rejected when it
//! introduces a violation or worsens an existing one. The search runs twice:
//! first treating advisory clauses as binding, then only strict ones, so
//! advisory clauses steer placement without ever making it impossible.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{debug, trace};

use crate::clause::Clause;
use crate::preference::compare_rows;
use crate::row::{ReplicaInfo, ReplicaType, Row};
use crate::session::Session;
use crate::violation::{evaluate, improves, introduces_violation, Scopes, Violation};

/// Kind of operation a suggester searches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Place a new replica.
    AddReplica,
    /// Relocate an existing replica.
    MoveReplica,
}

impl OperationKind {
    /// Command name used in operation descriptors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddReplica => "add-replica",
            Self::MoveReplica => "move-replica",
        }
    }
}

/// A constraint narrowing the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// Only consider this collection.
    Collection(String),
    /// Only consider this shard. Several hints mean any of them.
    CollectionShard(String, String),
    /// Only move replicas away from this node. Several hints mean any of them.
    SrcNode(String),
    /// Only place replicas on this node. Several hints mean any of them.
    TargetNode(String),
    /// Replica type to add, or to move.
    ReplicaType(ReplicaType),
}

#[derive(Debug, Clone, Default)]
struct Hints {
    scopes: Vec<(String, Option<String>)>,
    sources: BTreeSet<String>,
    targets: BTreeSet<String>,
    replica_type: Option<ReplicaType>,
}

impl Hints {
    fn allows_scope(&self, collection: &str, shard: Option<&str>) -> bool {
        self.scopes.is_empty()
            || self.scopes.iter().any(|(c, s)| {
                c == collection
                    && match (s.as_deref(), shard) {
                        (Some(hinted), Some(shard)) => hinted == shard,
                        _ => true,
                    }
            })
    }

    fn allows_replica(&self, replica: &ReplicaInfo) -> bool {
        self.allows_scope(&replica.collection, Some(&replica.shard))
            && self.replica_type.map_or(true, |t| t == replica.replica_type)
            && (self.sources.is_empty() || self.sources.contains(&replica.node))
    }

    fn allows_target(&self, node: &str) -> bool {
        self.targets.is_empty() || self.targets.contains(node)
    }
}

/// One accepted operation and the session it leads to.
#[derive(Debug, Clone)]
pub struct Suggestion {
    kind: OperationKind,
    collection: String,
    shard: String,
    replica_type: ReplicaType,
    target_node: String,
    source_node: Option<String>,
    replica: Option<ReplicaInfo>,
    session: Session,
}

impl Suggestion {
    /// Operation kind.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Collection of the placed or moved replica.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Shard of the placed or moved replica.
    #[must_use]
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Replica type.
    #[must_use]
    pub fn replica_type(&self) -> ReplicaType {
        self.replica_type
    }

    /// Node receiving the replica.
    #[must_use]
    pub fn target_node(&self) -> &str {
        &self.target_node
    }

    /// Node losing the replica, for moves.
    #[must_use]
    pub fn source_node(&self) -> Option<&str> {
        self.source_node.as_deref()
    }

    /// The moved replica, for moves.
    #[must_use]
    pub fn replica(&self) -> Option<&ReplicaInfo> {
        self.replica.as_ref()
    }

    /// Session after applying this operation.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Consumes the suggestion, returning the resulting session.
    #[must_use]
    pub fn into_session(self) -> Session {
        self.session
    }
}

/// Before-state of one collection, used to judge candidates.
struct Trial<'s> {
    session: &'s Session,
    clauses: Vec<Arc<Clause>>,
    scopes: Scopes,
    before: Vec<Violation>,
}

impl<'s> Trial<'s> {
    fn new(session: &'s Session, collection: &str, shard: Option<&str>) -> Self {
        let clauses = session.clauses_for(collection);
        let mut scopes = Scopes::new();
        let shards = scopes.entry(collection.to_string()).or_default();
        if let Some(observed) = session.scopes().remove(collection) {
            shards.extend(observed);
        }
        if let Some(shard) = shard {
            shards.insert(shard.to_string());
        }
        let mut trial = Self { session, clauses, scopes, before: Vec::new() };
        trial.before = trial.evaluate(session.sorted_rows());
        trial
    }

    fn evaluate(&self, rows: &[Arc<Row>]) -> Vec<Violation> {
        self.clauses.iter().flat_map(|c| evaluate(c, rows, &self.scopes)).collect()
    }

    fn rows_with(&self, changed: &[&Row]) -> Vec<Arc<Row>> {
        self.session
            .sorted_rows()
            .iter()
            .map(|row| match changed.iter().find(|c| c.node() == row.node()) {
                Some(replacement) => Arc::new((*replacement).clone()),
                None => Arc::clone(row),
            })
            .collect()
    }

    fn excludes(&self, row: &Row, replica: (&str, &str, ReplicaType)) -> bool {
        let (collection, shard, replica_type) = replica;
        self.clauses.iter().any(|c| {
            c.forbids_hosting()
                && c.applies_to(collection, shard, replica_type)
                && c.tag().is_pass(row.tag(c.tag().name()))
        })
    }
}

/// Searches one session for the next operation.
#[derive(Debug, Clone)]
pub struct Suggester<'a> {
    session: &'a Session,
    kind: OperationKind,
    hints: Hints,
    focus: Option<Violation>,
}

impl<'a> Suggester<'a> {
    pub(crate) fn new(session: &'a Session, kind: OperationKind) -> Self {
        Self { session, kind, hints: Hints::default(), focus: None }
    }

    /// Adds a hint.
    #[must_use]
    pub fn hint(mut self, hint: Hint) -> Self {
        match hint {
            Hint::Collection(c) => self.hints.scopes.push((c, None)),
            Hint::CollectionShard(c, s) => self.hints.scopes.push((c, Some(s))),
            Hint::SrcNode(n) => {
                self.hints.sources.insert(n);
            }
            Hint::TargetNode(n) => {
                self.hints.targets.insert(n);
            }
            Hint::ReplicaType(t) => self.hints.replica_type = Some(t),
        }
        self
    }

    /// Restricts a move search to resolving `violation`.
    #[must_use]
    pub fn resolving(mut self, violation: Violation) -> Self {
        self.focus = Some(violation);
        self
    }

    /// The session being searched.
    #[must_use]
    pub fn session(&self) -> &'a Session {
        self.session
    }

    /// Runs the search. `None` means the policy is satisfied for the hinted
    /// scope or no legal operation exists.
    #[must_use]
    pub fn suggestion(&self) -> Option<Suggestion> {
        let suggestion = match self.kind {
            OperationKind::AddReplica => self.suggest_add(),
            OperationKind::MoveReplica => self.suggest_move(),
        };
        match &suggestion {
            Some(s) => {
                counter!("rucket_placement_suggestions", "kind" => s.kind.as_str()).increment(1);
                debug!(
                    kind = s.kind.as_str(),
                    collection = %s.collection,
                    shard = %s.shard,
                    source = ?s.source_node,
                    target = %s.target_node,
                    "Suggested operation"
                );
            }
            None => debug!(kind = self.kind.as_str(), "No suggestion"),
        }
        suggestion
    }

    fn suggest_add(&self) -> Option<Suggestion> {
        let replica_type = self.hints.replica_type.unwrap_or_default();
        for (collection, shard) in &self.hints.scopes {
            let Some(shard) = shard else {
                debug!(collection = %collection, "Add-replica needs a shard, skipping collection hint");
                continue;
            };
            if let Some(suggestion) = self.try_add(collection, shard, replica_type) {
                return Some(suggestion);
            }
        }
        None
    }

    fn try_add(&self, collection: &str, shard: &str, replica_type: ReplicaType) -> Option<Suggestion> {
        let trial = Trial::new(self.session, collection, Some(shard));
        let candidates: Vec<&Arc<Row>> = self
            .session
            .sorted_rows()
            .iter()
            .filter(|r| r.is_live() && self.hints.allows_target(r.node()))
            .filter(|r| !trial.excludes(r, (collection, shard, replica_type)))
            .collect();

        let unmet_greedy: Vec<&Arc<Clause>> = trial
            .clauses
            .iter()
            .filter(|c| c.is_greedy() && c.is_strict() && c.applies_to(collection, shard, replica_type))
            .filter(|c| {
                trial.before.iter().any(|v| {
                    Arc::ptr_eq(v.clause(), c)
                        && v.delta() < 0.0
                        && v.shard().map_or(true, |s| s == shard)
                })
            })
            .collect();
        let (mut ordered, rest): (Vec<&Arc<Row>>, Vec<&Arc<Row>>) = candidates
            .into_iter()
            .partition(|r| unmet_greedy.iter().any(|c| c.tag().is_pass(r.tag(c.tag().name()))));
        ordered.extend(rest);

        for strict_only in [false, true] {
            for row in &ordered {
                let next = row.with_added_replica(collection, shard, replica_type);
                let after = trial.evaluate(&trial.rows_with(&[&next]));
                if introduces_violation(&trial.before, &after, strict_only) {
                    trace!(node = row.node(), strict_only, "Rejected add-replica target");
                    continue;
                }
                return Some(Suggestion {
                    kind: OperationKind::AddReplica,
                    collection: collection.to_string(),
                    shard: shard.to_string(),
                    replica_type,
                    target_node: row.node().to_string(),
                    source_node: None,
                    replica: None,
                    session: self.session.derive(vec![next]),
                });
            }
        }
        None
    }

    fn suggest_move(&self) -> Option<Suggestion> {
        let violations: Vec<&Violation> = match &self.focus {
            Some(v) => vec![v],
            None => self.session.violations().iter().collect(),
        };
        for violation in violations {
            if let Some(collection) = violation.collection() {
                if !self.hints.allows_scope(collection, violation.shard()) {
                    continue;
                }
            }
            if let Some(suggestion) = self.resolve(violation) {
                return Some(suggestion);
            }
        }
        if self.focus.is_none() && !(self.hints.sources.is_empty() && self.hints.targets.is_empty()) {
            return self.rebalance();
        }
        None
    }

    fn resolve(&self, violation: &Violation) -> Option<Suggestion> {
        let rows = self.session.sorted_rows();
        let clause = violation.clause();
        if violation.delta() > 0.0 {
            let mut candidates: Vec<&ReplicaInfo> =
                violation.replicas().iter().filter(|r| self.hints.allows_replica(r)).collect();
            // Free disk is recovered smallest index first.
            if clause.tag().name() == "freedisk" {
                candidates.sort_by(|a, b| smaller_index_first(a, b));
            }
            for replica in candidates {
                let Some(source) = self.session.row(&replica.node) else {
                    continue;
                };
                let targets = rows.iter().filter(|r| r.node() != source.node());
                if let Some(s) = self.try_move(source, replica, targets, Some(violation)) {
                    return Some(s);
                }
            }
            return None;
        }

        let in_group = |row: &Row| -> bool {
            if clause.is_node_attribute() {
                return violation.node() == Some(row.node());
            }
            let value = row.tag(clause.tag().name());
            clause.tag().is_pass(value)
                && violation.tag_value().map_or(true, |g| value.is_some_and(|v| v.matches(g)))
        };
        let targets: Vec<&Arc<Row>> = rows.iter().filter(|r| in_group(r)).collect();
        for source in rows.iter().rev().filter(|r| !in_group(r)) {
            let movable: Vec<&ReplicaInfo> = match violation.collection() {
                Some(collection) => source
                    .replicas_matching(collection, violation.shard(), clause.replica_type())
                    .collect(),
                None => source.iter_replicas().collect(),
            };
            for replica in movable.into_iter().filter(|r| self.hints.allows_replica(r)) {
                if let Some(s) = self.try_move(source, replica, targets.iter().copied(), Some(violation)) {
                    return Some(s);
                }
            }
        }
        None
    }

    fn rebalance(&self) -> Option<Suggestion> {
        let rows = self.session.sorted_rows();
        let sources: Vec<&Arc<Row>> = if self.hints.sources.is_empty() {
            rows.iter().rev().filter(|r| !self.hints.targets.contains(r.node())).collect()
        } else {
            rows.iter().filter(|r| self.hints.sources.contains(r.node())).collect()
        };
        for source in sources {
            for replica in source.iter_replicas().filter(|r| self.hints.allows_replica(r)) {
                let targets = rows.iter().filter(|r| r.node() != source.node());
                if let Some(s) = self.try_move(source, replica, targets, None) {
                    return Some(s);
                }
            }
        }
        None
    }

    fn try_move<'r>(
        &self,
        source: &Row,
        replica: &ReplicaInfo,
        targets: impl Iterator<Item = &'r Arc<Row>>,
        focus: Option<&Violation>,
    ) -> Option<Suggestion> {
        let trial = Trial::new(self.session, &replica.collection, None);
        let source_after = source.without_replica(replica)?;
        let scope = (replica.collection.as_str(), replica.shard.as_str(), replica.replica_type);
        let targets: Vec<&Arc<Row>> = targets
            .filter(|r| r.is_live() && self.hints.allows_target(r.node()))
            .filter(|r| !trial.excludes(r, scope))
            .collect();
        let preferences = self.session.policy().preferences();

        for strict_only in [false, true] {
            for target in &targets {
                let target_after = target.with_replica(replica.clone());
                let after = trial.evaluate(&trial.rows_with(&[&source_after, &target_after]));
                if introduces_violation(&trial.before, &after, strict_only) {
                    trace!(replica = %replica.name, target = target.node(), strict_only, "Rejected move target");
                    continue;
                }
                let accepted = match focus {
                    Some(violation) => improves(violation, &after),
                    None => {
                        !source.is_live()
                            || compare_rows(&target_after, &source_after, preferences) != Ordering::Greater
                    }
                };
                if !accepted {
                    continue;
                }
                return Some(Suggestion {
                    kind: OperationKind::MoveReplica,
                    collection: replica.collection.clone(),
                    shard: replica.shard.clone(),
                    replica_type: replica.replica_type,
                    target_node: target.node().to_string(),
                    source_node: Some(source.node().to_string()),
                    replica: Some(replica.clone()),
                    session: self.session.derive(vec![source_after.clone(), target_after]),
                });
            }
        }
        None
    }
}

/// Orders replicas by index size, ascending. Replicas without a reported
/// size sort last and otherwise keep their relative order.
fn smaller_index_first(a: &ReplicaInfo, b: &ReplicaInfo) -> Ordering {
    match (a.size_gib(), b.size_gib()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
