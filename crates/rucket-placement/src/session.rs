// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Immutable cluster snapshots.
//!
//! A session is built once from the providers: one [`Row`] per live or down
//! node, sorted by the policy's preferences, plus the violations of every
//! clause that applies to an observed collection. Applying a suggestion never
//! changes a session; it derives a new one with a higher generation that
//! shares all unchanged rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::clause::{sort_clauses, Clause};
use crate::error::{PolicyError, Result};
use crate::policy::Policy;
use crate::preference::sort_rows;
use crate::provider::{ClusterStateProvider, NodeStateProvider};
use crate::row::Row;
use crate::suggester::{OperationKind, Suggester};
use crate::value::TagValue;
use crate::variable;
use crate::violation::{evaluate, observed_scopes, Scopes, Violation};

/// A snapshot of all rows with their sort order and violations.
#[derive(Clone)]
pub struct Session {
    policy: Arc<Policy>,
    cluster: Arc<dyn ClusterStateProvider>,
    overrides: Arc<BTreeMap<String, String>>,
    rows: Vec<Arc<Row>>,
    clauses: Vec<Arc<Clause>>,
    violations: Vec<Violation>,
    generation: u64,
}

impl Session {
    /// Builds a session from the providers.
    ///
    /// Only the attributes referenced by `policy` are requested from nodes.
    /// Down nodes contribute their replicas but no attribute values.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Provider`] if a provider call fails.
    pub fn build(
        policy: Arc<Policy>,
        cluster: Arc<dyn ClusterStateProvider>,
        nodes: &dyn NodeStateProvider,
    ) -> Result<Self> {
        let live = cluster.live_nodes().map_err(PolicyError::Provider)?;
        let down = cluster.down_nodes().map_err(PolicyError::Provider)?;
        let names: Vec<String> = policy.attribute_names().into_iter().collect();

        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        for node in live {
            if !seen.insert(node.clone()) {
                continue;
            }
            let raw = nodes.node_values(&node, &names).map_err(PolicyError::Provider)?;
            let mut tags = BTreeMap::new();
            for (name, value) in raw {
                if !names.contains(&name) {
                    continue;
                }
                match variable::validate(&name, &value, false) {
                    Ok(coerced) => {
                        tags.insert(name, coerced);
                    }
                    Err(e) => warn!(node = %node, attribute = %name, error = %e, "Ignoring invalid node value"),
                }
            }
            let replicas = nodes.replica_info(&node, &[]).map_err(PolicyError::Provider)?;
            if names.iter().any(|n| n == "cores") && !tags.contains_key("cores") {
                let hosted = replicas.values().flat_map(|s| s.values()).map(Vec::len).sum::<usize>();
                tags.insert("cores".to_string(), TagValue::Int(hosted as i64));
            }
            rows.push(Arc::new(Row::new(node, rows.len(), true, tags, replicas)));
        }
        for node in down {
            if !seen.insert(node.clone()) {
                continue;
            }
            let replicas = nodes.replica_info(&node, &[]).map_err(PolicyError::Provider)?;
            rows.push(Arc::new(Row::new(node, rows.len(), false, BTreeMap::new(), replicas)));
        }

        let mut session = Self {
            policy,
            cluster,
            overrides: Arc::new(BTreeMap::new()),
            rows,
            clauses: Vec::new(),
            violations: Vec::new(),
            generation: 0,
        };
        session.recompute();

        counter!("rucket_placement_sessions_built").increment(1);
        gauge!("rucket_placement_violations").set(session.violations.len() as f64);
        debug!(
            nodes = session.rows.len(),
            clauses = session.clauses.len(),
            violations = session.violations.len(),
            "Built placement session"
        );
        Ok(session)
    }

    /// The policy this session evaluates.
    #[must_use]
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Generation number; derived sessions count up from their parent.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rows best-first. Down rows come last.
    #[must_use]
    pub fn sorted_rows(&self) -> &[Arc<Row>] {
        &self.rows
    }

    /// Row of `node`.
    #[must_use]
    pub fn row(&self, node: &str) -> Option<&Arc<Row>> {
        self.rows.iter().find(|r| r.node() == node)
    }

    /// Live node ids in sort order.
    pub fn live_nodes(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().filter(|r| r.is_live()).map(|r| r.node())
    }

    /// Clauses in effect for the observed collections, in priority order.
    #[must_use]
    pub fn clauses(&self) -> &[Arc<Clause>] {
        &self.clauses
    }

    /// All violations, strict and advisory, in clause priority order.
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Violations of strict clauses only.
    pub fn strict_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_strict())
    }

    /// Policy name attached to `collection`.
    #[must_use]
    pub fn policy_name(&self, collection: &str) -> Option<String> {
        self.overrides
            .get(collection)
            .cloned()
            .or_else(|| self.cluster.policy_name_for_collection(collection))
    }

    /// Merged clauses for `collection`, including node-attribute clauses.
    #[must_use]
    pub fn clauses_for(&self, collection: &str) -> Vec<Arc<Clause>> {
        self.policy
            .merged_clauses(collection, self.policy_name(collection).as_deref())
            .into_iter()
            .map(|clause| {
                self.clauses
                    .iter()
                    .find(|existing| ***existing == clause)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(clause))
            })
            .collect()
    }

    /// Derives a session in which `mapping` assigns policy names to
    /// collections, taking precedence over the cluster state provider.
    #[must_use]
    pub fn with_policy_mapping(&self, mapping: &BTreeMap<String, String>) -> Session {
        if mapping.is_empty() {
            return self.clone();
        }
        let mut overrides = (*self.overrides).clone();
        overrides.extend(mapping.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut next = self.clone();
        next.overrides = Arc::new(overrides);
        next.generation = self.generation + 1;
        next.recompute();
        next
    }

    /// Starts a suggester over this session.
    #[must_use]
    pub fn suggester(&self, kind: OperationKind) -> Suggester<'_> {
        Suggester::new(self, kind)
    }

    /// Collections and shards hosted on live rows.
    #[must_use]
    pub fn scopes(&self) -> Scopes {
        observed_scopes(&self.rows)
    }

    /// Derives a session with `changed` rows replacing rows of the same node.
    pub(crate) fn derive(&self, changed: Vec<Row>) -> Session {
        let mut next = self.clone();
        for row in changed {
            match next.rows.iter().position(|r| r.node() == row.node()) {
                Some(i) => next.rows[i] = Arc::new(row),
                None => next.rows.push(Arc::new(row)),
            }
        }
        next.generation = self.generation + 1;
        next.recompute();
        next
    }

    fn recompute(&mut self) {
        sort_rows(&mut self.rows, self.policy.preferences());
        let scopes = observed_scopes(&self.rows);

        let mut expanded: Vec<Clause> =
            self.policy.cluster_clauses().iter().filter(|c| c.is_node_attribute()).cloned().collect();
        for collection in scopes.keys() {
            let name = self.policy_name(collection);
            for clause in self.policy.merged_clauses(collection, name.as_deref()) {
                if !expanded.contains(&clause) {
                    expanded.push(clause);
                }
            }
        }
        sort_clauses(&mut expanded);
        self.clauses = expanded.into_iter().map(Arc::new).collect();
        self.violations =
            self.clauses.iter().flat_map(|c| evaluate(c, &self.rows, &scopes)).collect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("nodes", &self.rows.iter().map(|r| r.node()).collect::<Vec<_>>())
            .field("violations", &self.violations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::provider::InMemoryCluster;
    use crate::row::{CollectionReplicas, ReplicaInfo, ReplicaType};

    fn cluster() -> Arc<InMemoryCluster> {
        Arc::new(
            InMemoryCluster::new()
                .with_node("node1", [("cores", json!(2)), ("freedisk", json!(100)), ("unused", json!(1))])
                .with_node("node2", [("cores", json!(0)), ("freedisk", json!(900))])
                .with_replica(ReplicaInfo::new("r1", "c1", "s1", ReplicaType::Nrt, "node1"))
                .with_replica(ReplicaInfo::new("r2", "c1", "s1", ReplicaType::Nrt, "node1")),
        )
    }

    fn policy() -> Arc<Policy> {
        Arc::new(
            Policy::from_json(&json!({
                "cluster-policy": [{"replica": "<2", "shard": "#EACH", "node": "#ANY"}],
                "cluster-preferences": [{"minimize": "cores"}]
            }))
            .unwrap(),
        )
    }

    fn build(policy: Arc<Policy>, cluster: &Arc<InMemoryCluster>) -> Session {
        Session::build(policy, cluster.clone(), cluster.as_ref()).unwrap()
    }

    #[test]
    fn test_build_fetches_only_referenced_attributes() {
        let cluster = cluster();
        let session = build(policy(), &cluster);
        let node1 = session.row("node1").unwrap();
        assert!(node1.tag("cores").is_some());
        assert!(node1.tag("unused").is_none());
        assert!(node1.tag("freedisk").is_none());
        assert_eq!(session.generation(), 0);
    }

    #[test]
    fn test_sorted_and_violations() {
        let cluster = cluster();
        let session = build(policy(), &cluster);
        let nodes: Vec<&str> = session.live_nodes().collect();
        assert_eq!(nodes, vec!["node2", "node1"]);
        assert_eq!(session.violations().len(), 1);
        assert_eq!(session.violations()[0].node(), Some("node1"));
        assert_eq!(session.strict_violations().count(), 1);
    }

    #[test]
    fn test_derive_is_copy_on_write() {
        let cluster = cluster();
        let session = build(policy(), &cluster);
        let (node1, _) = session.row("node1").unwrap().with_removed_replica("c1", "s1", None).unwrap();
        let next = session.derive(vec![node1]);

        assert_eq!(next.generation(), 1);
        assert!(next.violations().is_empty());
        assert_eq!(session.violations().len(), 1);
        assert_eq!(session.row("node1").unwrap().replica_count("c1", None, None), 2);
        assert!(Arc::ptr_eq(session.row("node2").unwrap(), next.row("node2").unwrap()));
    }

    #[test]
    fn test_cores_derived_when_not_reported() {
        let cluster = Arc::new(
            InMemoryCluster::new()
                .with_node("a", Vec::<(String, serde_json::Value)>::new())
                .with_replica(ReplicaInfo::new("r1", "c1", "s1", ReplicaType::Nrt, "a")),
        );
        let session = build(policy(), &cluster);
        assert_eq!(session.row("a").unwrap().tag("cores"), Some(&TagValue::Int(1)));
    }

    #[test]
    fn test_down_nodes_are_not_live() {
        let cluster = cluster();
        cluster.mark_down("node1");
        let session = build(policy(), &cluster);
        let node1 = session.row("node1").unwrap();
        assert!(!node1.is_live());
        assert!(node1.tag("cores").is_none());
        assert_eq!(session.sorted_rows().last().unwrap().node(), "node1");
        assert!(session.violations().is_empty());
    }

    #[test]
    fn test_policy_mapping_overrides_provider() {
        let cluster = cluster();
        let policy = Arc::new(
            Policy::from_json(&json!({
                "policies": {"strict": [{"replica": "<3", "shard": "#EACH", "node": "#ANY"}]},
                "cluster-policy": [{"replica": "<2", "shard": "#EACH", "node": "#ANY"}]
            }))
            .unwrap(),
        );
        let session = build(policy, &cluster);
        assert_eq!(session.violations().len(), 1);

        let mapping = BTreeMap::from([("c1".to_string(), "strict".to_string())]);
        let relaxed = session.with_policy_mapping(&mapping);
        assert_eq!(relaxed.policy_name("c1").as_deref(), Some("strict"));
        assert!(relaxed.violations().is_empty());
    }

    struct FailingNodes;

    impl NodeStateProvider for FailingNodes {
        fn node_values(
            &self,
            _node: &str,
            _names: &[String],
        ) -> std::result::Result<BTreeMap<String, serde_json::Value>, BoxError> {
            Err("metrics endpoint timed out".into())
        }

        fn replica_info(
            &self,
            _node: &str,
            _collections: &[String],
        ) -> std::result::Result<CollectionReplicas, BoxError> {
            Ok(CollectionReplicas::new())
        }
    }

    #[test]
    fn test_provider_errors_propagate() {
        let cluster = cluster();
        let err = Session::build(policy(), cluster, &FailingNodes).unwrap_err();
        assert!(matches!(err, PolicyError::Provider(_)));
        assert!(err.to_string().contains("metrics endpoint timed out"));
    }
}
