// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Traits for reading cluster and node state.
//!
//! The engine never talks to the cluster itself. Callers supply these
//! providers and a session reads them exactly once, when it is built.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BoxError, Result};
use crate::row::{CollectionReplicas, ReplicaInfo, ReplicaType};

/// Source of cluster membership and collection metadata.
pub trait ClusterStateProvider: Send + Sync {
    /// Returns the ids of all live nodes in discovery order.
    fn live_nodes(&self) -> std::result::Result<Vec<String>, BoxError>;

    /// Returns nodes that still host replicas but are no longer live.
    fn down_nodes(&self) -> std::result::Result<Vec<String>, BoxError> {
        Ok(Vec::new())
    }

    /// Returns the name of the policy attached to `collection`, if any.
    fn policy_name_for_collection(&self, _collection: &str) -> Option<String> {
        None
    }
}

/// Source of per-node attribute values and hosted replicas.
pub trait NodeStateProvider: Send + Sync {
    /// Returns the requested attribute values of `node`. Attributes the node
    /// does not report are simply absent.
    fn node_values(
        &self,
        node: &str,
        names: &[String],
    ) -> std::result::Result<BTreeMap<String, Value>, BoxError>;

    /// Returns the replicas hosted on `node`, restricted to `collections`
    /// unless it is empty.
    fn replica_info(
        &self,
        node: &str,
        collections: &[String],
    ) -> std::result::Result<CollectionReplicas, BoxError>;
}

/// Replica entry of a [`ClusterSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReplica {
    /// Replica name.
    pub name: String,
    /// Core name; defaults to the replica name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
    /// Replica type.
    #[serde(rename = "type", default)]
    pub replica_type: ReplicaType,
    /// Any other replica attributes.
    #[serde(flatten)]
    pub variables: BTreeMap<String, Value>,
}

/// Serializable cluster state used by [`InMemoryCluster`].
///
/// Nodes listed under `replicaInfo` but missing from `liveNodes` are
/// reported as down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSnapshot {
    /// Live node ids in discovery order.
    pub live_nodes: Vec<String>,
    /// Attribute values per node.
    pub node_values: BTreeMap<String, BTreeMap<String, Value>>,
    /// Replicas per node, collection and shard, in the order listed.
    pub replica_info: IndexMap<String, IndexMap<String, IndexMap<String, Vec<SnapshotReplica>>>>,
    /// Policy name per collection.
    pub collection_policies: BTreeMap<String, String>,
}

/// An in-memory cluster implementing both provider traits.
///
/// Useful for simulations and tests. State can be changed between session
/// builds, e.g. to take a node down.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterSnapshot>,
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cluster from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        Self { state: RwLock::new(snapshot) }
    }

    /// Parses a JSON snapshot.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the text is not a valid snapshot.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(Self::from_snapshot(serde_json::from_str(text)?))
    }

    /// Adds a live node with attribute values.
    #[must_use]
    pub fn with_node<K, V>(self, node: &str, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        {
            let mut state = self.state.write();
            if !state.live_nodes.iter().any(|n| n == node) {
                state.live_nodes.push(node.to_string());
            }
            let entry = state.node_values.entry(node.to_string()).or_default();
            entry.extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        self
    }

    /// Adds a hosted replica on `replica.node`.
    #[must_use]
    pub fn with_replica(self, replica: ReplicaInfo) -> Self {
        self.add_replica(replica);
        self
    }

    /// Attaches a named policy to a collection.
    #[must_use]
    pub fn with_collection_policy(self, collection: &str, policy: &str) -> Self {
        self.state
            .write()
            .collection_policies
            .insert(collection.to_string(), policy.to_string());
        self
    }

    /// Adds a hosted replica on `replica.node`.
    pub fn add_replica(&self, replica: ReplicaInfo) {
        let core = (replica.core != replica.name).then(|| replica.core.clone());
        self.state
            .write()
            .replica_info
            .entry(replica.node)
            .or_default()
            .entry(replica.collection)
            .or_default()
            .entry(replica.shard)
            .or_default()
            .push(SnapshotReplica {
                name: replica.name,
                core,
                replica_type: replica.replica_type,
                variables: replica.variables,
            });
    }

    /// Removes `node` from the live set. Its replicas stay behind and the node
    /// is reported as down.
    pub fn mark_down(&self, node: &str) {
        self.state.write().live_nodes.retain(|n| n != node);
    }

    /// Sets one attribute value of a node.
    pub fn set_node_value(&self, node: &str, name: &str, value: impl Into<Value>) {
        self.state
            .write()
            .node_values
            .entry(node.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.state.read().clone()
    }
}

impl ClusterStateProvider for InMemoryCluster {
    fn live_nodes(&self) -> std::result::Result<Vec<String>, BoxError> {
        Ok(self.state.read().live_nodes.clone())
    }

    fn down_nodes(&self) -> std::result::Result<Vec<String>, BoxError> {
        let state = self.state.read();
        Ok(state
            .replica_info
            .keys()
            .filter(|node| !state.live_nodes.contains(node))
            .cloned()
            .collect())
    }

    fn policy_name_for_collection(&self, collection: &str) -> Option<String> {
        self.state.read().collection_policies.get(collection).cloned()
    }
}

impl NodeStateProvider for InMemoryCluster {
    fn node_values(
        &self,
        node: &str,
        names: &[String],
    ) -> std::result::Result<BTreeMap<String, Value>, BoxError> {
        let state = self.state.read();
        let Some(values) = state.node_values.get(node) else {
            return Ok(BTreeMap::new());
        };
        Ok(values
            .iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }

    fn replica_info(
        &self,
        node: &str,
        collections: &[String],
    ) -> std::result::Result<CollectionReplicas, BoxError> {
        let state = self.state.read();
        let Some(hosted) = state.replica_info.get(node) else {
            return Ok(CollectionReplicas::new());
        };
        let mut result = CollectionReplicas::new();
        for (collection, shards) in hosted {
            if !collections.is_empty() && !collections.contains(collection) {
                continue;
            }
            for (shard, replicas) in shards {
                let infos = replicas.iter().map(|r| ReplicaInfo {
                    name: r.name.clone(),
                    core: r.core.clone().unwrap_or_else(|| r.name.clone()),
                    collection: collection.clone(),
                    shard: shard.clone(),
                    replica_type: r.replica_type,
                    node: node.to_string(),
                    variables: r.variables.clone(),
                });
                result
                    .entry(collection.clone())
                    .or_default()
                    .entry(shard.clone())
                    .or_default()
                    .extend(infos);
            }
        }
        Ok(result)
    }
}
