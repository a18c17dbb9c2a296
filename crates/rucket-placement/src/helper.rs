// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! High-level placement entry points.
//!
//! [`place_replicas`] assigns nodes to every replica of a new or growing
//! collection by chaining add-replica suggestions. [`collect_suggestions`]
//! turns the violations of a session into a batch of corrective moves.
//! [`PolicyHelper`] wires both to a pair of state providers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::{SessionCache, SessionScope};
use crate::config::EngineConfig;
use crate::error::{PolicyError, Result};
use crate::policy::Policy;
use crate::provider::{ClusterStateProvider, NodeStateProvider};
use crate::row::ReplicaType;
use crate::session::Session;
use crate::suggester::{Hint, OperationKind, Suggestion};
use crate::violation::Violation;

/// Where one requested replica should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaPosition {
    /// Collection name.
    pub collection: String,
    /// Shard name.
    pub shard: String,
    /// Position of the replica within its shard, counting all types.
    pub index: usize,
    /// Replica type.
    pub replica_type: ReplicaType,
    /// Chosen node.
    pub node: String,
}

/// Replicas to place for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementRequest {
    collection: String,
    shard_names: Vec<String>,
    nrt: usize,
    tlog: usize,
    pull: usize,
    nodes: Option<Vec<String>>,
    policy_mapping: BTreeMap<String, String>,
}

impl PlacementRequest {
    /// Creates a request for `collection` with the given shards and no replicas.
    #[must_use]
    pub fn new<S: Into<String>>(collection: impl Into<String>, shards: impl IntoIterator<Item = S>) -> Self {
        Self {
            collection: collection.into(),
            shard_names: shards.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the number of replicas per shard for each type.
    #[must_use]
    pub fn with_replicas(mut self, nrt: usize, tlog: usize, pull: usize) -> Self {
        self.nrt = nrt;
        self.tlog = tlog;
        self.pull = pull;
        self
    }

    /// Restricts placement to these nodes. An empty list places anywhere.
    #[must_use]
    pub fn with_nodes<S: Into<String>>(mut self, nodes: impl IntoIterator<Item = S>) -> Self {
        let nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();
        self.nodes = (!nodes.is_empty()).then_some(nodes);
        self
    }

    /// Attaches the named policy to `collection` for this placement.
    #[must_use]
    pub fn with_policy_name(mut self, collection: impl Into<String>, policy: impl Into<String>) -> Self {
        self.policy_mapping.insert(collection.into(), policy.into());
        self
    }

    /// Collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Shards to place.
    #[must_use]
    pub fn shard_names(&self) -> &[String] {
        &self.shard_names
    }

    /// Number of replicas of `replica_type` per shard.
    #[must_use]
    pub fn count(&self, replica_type: ReplicaType) -> usize {
        match replica_type {
            ReplicaType::Nrt => self.nrt,
            ReplicaType::Tlog => self.tlog,
            ReplicaType::Pull => self.pull,
        }
    }

    /// Node restriction, if any.
    #[must_use]
    pub fn nodes(&self) -> Option<&[String]> {
        self.nodes.as_deref()
    }
}

/// A violation together with a move that works on it.
#[derive(Debug, Clone)]
pub struct SuggestionInfo {
    violation: Violation,
    suggestion: Suggestion,
}

impl SuggestionInfo {
    /// The violation being worked on, as it was before the move.
    #[must_use]
    pub fn violation(&self) -> &Violation {
        &self.violation
    }

    /// The move.
    #[must_use]
    pub fn suggestion(&self) -> &Suggestion {
        &self.suggestion
    }

    /// Renders `{violation, operation}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "violation": self.violation.to_json(),
            "operation": self.suggestion.to_operation().to_json(),
        })
    }
}

/// Picks a node for every replica in `request`.
///
/// Shards are placed one after another; within a shard NRT replicas come
/// first, then TLOG, then PULL. Each placement sees the previous ones. The
/// returned session includes all placed replicas.
///
/// # Errors
///
/// Returns [`PolicyError::Placement`] for the first replica no node can take.
pub fn place_replicas(session: &Session, request: &PlacementRequest) -> Result<(Vec<ReplicaPosition>, Session)> {
    let mut current = session.with_policy_mapping(&request.policy_mapping);
    let mut positions = Vec::new();

    for shard in &request.shard_names {
        let mut index = 0;
        for replica_type in ReplicaType::ALL {
            for _ in 0..request.count(replica_type) {
                let mut suggester = current
                    .suggester(OperationKind::AddReplica)
                    .hint(Hint::CollectionShard(request.collection.clone(), shard.clone()))
                    .hint(Hint::ReplicaType(replica_type));
                for node in request.nodes.iter().flatten() {
                    suggester = suggester.hint(Hint::TargetNode(node.clone()));
                }
                let Some(suggestion) = suggester.suggestion() else {
                    return Err(PolicyError::Placement {
                        collection: request.collection.clone(),
                        shard: shard.clone(),
                        replica_type,
                        reason: placement_failure(&current, request),
                    });
                };
                debug!(
                    collection = %request.collection,
                    shard = %shard,
                    replica_type = %replica_type,
                    node = suggestion.target_node(),
                    "Placed replica"
                );
                positions.push(ReplicaPosition {
                    collection: request.collection.clone(),
                    shard: shard.clone(),
                    index,
                    replica_type,
                    node: suggestion.target_node().to_string(),
                });
                index += 1;
                current = suggestion.into_session();
            }
        }
    }

    info!(
        collection = %request.collection,
        shards = request.shard_names.len(),
        replicas = positions.len(),
        "Computed replica placement"
    );
    Ok((positions, current))
}

fn placement_failure(session: &Session, request: &PlacementRequest) -> String {
    let live: Vec<&str> = match &request.nodes {
        Some(nodes) => session.live_nodes().filter(|n| nodes.iter().any(|m| m == n)).collect(),
        None => session.live_nodes().collect(),
    };
    if live.is_empty() {
        return "no live nodes to place on".to_string();
    }
    format!("no node among [{}] satisfies the policy", live.join(", "))
}

/// Builds a batch of moves that work on the violations of `session`.
///
/// Violations are taken in order. For each, focused move suggestions are
/// chained until the violation is gone, no improving move exists or
/// `max_moves_per_violation` is reached. Later violations see the effect of
/// earlier moves, and ones already resolved by them are skipped.
#[must_use]
pub fn collect_suggestions(session: &Session, config: &EngineConfig) -> Vec<SuggestionInfo> {
    let targets: Vec<&Violation> = session
        .violations()
        .iter()
        .filter(|v| config.include_advisory || v.is_strict())
        .collect();

    let mut batch = Vec::new();
    let mut current = session.clone();
    'violations: for target in targets {
        let Some(mut focus) = current.violations().iter().find(|v| v.same_scope(target)).cloned() else {
            continue;
        };
        for _ in 0..config.max_moves_per_violation {
            if batch.len() >= config.max_suggestions {
                break 'violations;
            }
            let Some(suggestion) = current.suggester(OperationKind::MoveReplica).resolving(focus.clone()).suggestion()
            else {
                break;
            };
            current = suggestion.session().clone();
            let remaining = current.violations().iter().find(|v| v.same_scope(&focus)).cloned();
            batch.push(SuggestionInfo { violation: focus, suggestion });
            match remaining {
                Some(v) => focus = v,
                None => break,
            }
        }
    }

    debug!(violations = session.violations().len(), suggestions = batch.len(), "Collected suggestions");
    batch
}

/// Placement and repair over a pair of state providers.
#[derive(Clone)]
pub struct PolicyHelper {
    cluster: Arc<dyn ClusterStateProvider>,
    nodes: Arc<dyn NodeStateProvider>,
    config: EngineConfig,
}

impl PolicyHelper {
    /// Creates a helper with the default configuration.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterStateProvider>, nodes: Arc<dyn NodeStateProvider>) -> Self {
        Self { cluster, nodes, config: EngineConfig::default() }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Builds a fresh session for `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Provider`] if a provider call fails.
    pub fn session(&self, policy: Arc<Policy>) -> Result<Session> {
        Session::build(policy, Arc::clone(&self.cluster), self.nodes.as_ref())
    }

    /// Places `request` on a fresh session.
    ///
    /// # Errors
    ///
    /// Returns a provider error or [`PolicyError::Placement`].
    pub fn replica_locations(&self, policy: &Arc<Policy>, request: &PlacementRequest) -> Result<Vec<ReplicaPosition>> {
        let session = self.session(Arc::clone(policy))?;
        place_replicas(&session, request).map(|(positions, _)| positions)
    }

    /// Places `request` on the session cached for `scope`, storing the
    /// resulting session back for later calls in the same scope.
    ///
    /// # Errors
    ///
    /// Returns a provider error or [`PolicyError::Placement`].
    pub fn replica_locations_in_scope(
        &self,
        cache: &SessionCache,
        scope: SessionScope,
        policy: &Arc<Policy>,
        request: &PlacementRequest,
    ) -> Result<Vec<ReplicaPosition>> {
        let lease = cache.acquire(scope, policy, || self.session(Arc::clone(policy)))?;
        let result = place_replicas(lease.session(), request);
        let positions = match result {
            Ok((positions, next)) => {
                if !cache.update(&lease, next) {
                    warn!(
                        scope = scope.id(),
                        version = lease.version(),
                        "Cached session was replaced before placements could be stored"
                    );
                }
                Ok(positions)
            }
            Err(e) => Err(e),
        };
        cache.release(scope, lease.version());
        positions
    }

    /// Corrective moves for the current cluster state.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Provider`] if a provider call fails.
    pub fn suggestions(&self, policy: &Arc<Policy>) -> Result<Vec<SuggestionInfo>> {
        let session = self.session(Arc::clone(policy))?;
        let batch = collect_suggestions(&session, &self.config);
        info!(violations = session.violations().len(), suggestions = batch.len(), "Computed policy suggestions");
        Ok(batch)
    }
}

impl fmt::Debug for PolicyHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyHelper").field("config", &self.config).finish_non_exhaustive()
    }
}
