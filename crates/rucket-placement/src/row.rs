// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Per-node snapshots.
//!
//! A [`Row`] captures one node's attribute values and the replicas it hosts at
//! the moment a session was built. Rows are immutable: simulating an add or a
//! removal returns a new row and leaves the original untouched, so candidate
//! placements can be explored without disturbing the baseline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;
use crate::value::TagValue;

/// Replica variable holding the index size in bytes.
pub const INDEX_SIZE_KEY: &str = "INDEX.sizeInBytes";

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Kind of replica.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaType {
    /// Full index, near-real-time replica.
    #[default]
    Nrt,
    /// Transaction-log-only replica.
    Tlog,
    /// Search-only replica pulling from the leader.
    Pull,
}

impl ReplicaType {
    /// All replica types in placement order.
    pub const ALL: [ReplicaType; 3] = [Self::Nrt, Self::Tlog, Self::Pull];

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nrt => "NRT",
            Self::Tlog => "TLOG",
            Self::Pull => "PULL",
        }
    }
}

impl fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NRT" => Ok(Self::Nrt),
            "TLOG" => Ok(Self::Tlog),
            "PULL" => Ok(Self::Pull),
            _ => Err(PolicyError::validation(
                "type",
                format!("'{s}' must be one of [\"NRT\", \"TLOG\", \"PULL\"]"),
            )),
        }
    }
}

/// One hosted replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Replica name, unique within the shard.
    pub name: String,
    /// Core name on the hosting node.
    pub core: String,
    /// Owning collection.
    pub collection: String,
    /// Owning shard.
    pub shard: String,
    /// Replica type.
    #[serde(rename = "type", default)]
    pub replica_type: ReplicaType,
    /// Hosting node.
    pub node: String,
    /// Opaque attributes copied from the replica provider.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl ReplicaInfo {
    /// Creates a replica whose core name equals its replica name.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        replica_type: ReplicaType,
        node: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            core: name.clone(),
            name,
            collection: collection.into(),
            shard: shard.into(),
            replica_type,
            node: node.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Sets the core name.
    #[must_use]
    pub fn with_core(mut self, core: impl Into<String>) -> Self {
        self.core = core.into();
        self
    }

    /// Adds an opaque attribute.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Index size in GiB, when the provider reported one.
    #[must_use]
    pub fn size_gib(&self) -> Option<f64> {
        self.variables.get(INDEX_SIZE_KEY).and_then(Value::as_f64).map(|b| b / BYTES_PER_GIB)
    }

    fn same_replica(&self, other: &ReplicaInfo) -> bool {
        self.name == other.name && self.collection == other.collection && self.shard == other.shard
    }
}

/// Replicas of one collection keyed by shard, in provider order.
pub type ShardReplicas = IndexMap<String, Vec<ReplicaInfo>>;

/// Replicas hosted on a node keyed by collection, then shard. Both levels keep
/// the order in which the provider reported them.
pub type CollectionReplicas = IndexMap<String, ShardReplicas>;

/// Immutable snapshot of a single node.
#[derive(Debug, Clone)]
pub struct Row {
    node: String,
    live: bool,
    index: usize,
    tags: BTreeMap<String, TagValue>,
    replicas: CollectionReplicas,
}

impl Row {
    /// Creates a row. `index` is the node's discovery position and breaks
    /// sorting ties.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        index: usize,
        live: bool,
        mut tags: BTreeMap<String, TagValue>,
        replicas: CollectionReplicas,
    ) -> Self {
        let node = node.into();
        tags.insert("node".to_string(), TagValue::Str(node.clone()));
        Self { node, live, index, tags, replicas }
    }

    /// Node id.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether the node is live. Down nodes never receive replicas.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Discovery position.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// All attribute values, including `node`.
    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }

    /// Value of a single attribute.
    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name)
    }

    /// Hosted replicas.
    #[must_use]
    pub fn replicas(&self) -> &CollectionReplicas {
        &self.replicas
    }

    /// Iterates hosted replicas in the order the provider reported them.
    pub fn iter_replicas(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.values().flat_map(|shards| shards.values().flatten())
    }

    /// Number of hosted replicas matching the filters.
    #[must_use]
    pub fn replica_count(
        &self,
        collection: &str,
        shard: Option<&str>,
        replica_type: Option<ReplicaType>,
    ) -> usize {
        self.replicas_matching(collection, shard, replica_type).count()
    }

    /// Hosted replicas of `collection`, optionally narrowed by shard and type.
    pub fn replicas_matching<'a>(
        &'a self,
        collection: &str,
        shard: Option<&'a str>,
        replica_type: Option<ReplicaType>,
    ) -> impl Iterator<Item = &'a ReplicaInfo> {
        self.replicas
            .get(collection)
            .into_iter()
            .flat_map(|shards| shards.iter())
            .filter(move |(name, _)| shard.map_or(true, |s| s == name.as_str()))
            .flat_map(|(_, replicas)| replicas.iter())
            .filter(move |r| replica_type.map_or(true, |t| t == r.replica_type))
    }

    /// Returns a copy of this row hosting one more replica of the given shard.
    #[must_use]
    pub fn with_added_replica(
        &self,
        collection: &str,
        shard: &str,
        replica_type: ReplicaType,
    ) -> Row {
        let ordinal = self.replica_count(collection, Some(shard), None) + 1;
        let name = format!("pending-{collection}-{shard}-{ordinal}");
        self.with_replica(ReplicaInfo::new(name, collection, shard, replica_type, ""))
    }

    /// Returns a copy of this row hosting `replica`, which is re-homed here.
    #[must_use]
    pub fn with_replica(&self, mut replica: ReplicaInfo) -> Row {
        let mut row = self.clone();
        replica.node = row.node.clone();
        row.adjust_usage(&replica, 1.0);
        row.replicas
            .entry(replica.collection.clone())
            .or_default()
            .entry(replica.shard.clone())
            .or_default()
            .push(replica);
        row
    }

    /// Returns a copy of this row without the first replica of the given shard
    /// (and type, if given), together with the removed replica.
    #[must_use]
    pub fn with_removed_replica(
        &self,
        collection: &str,
        shard: &str,
        replica_type: Option<ReplicaType>,
    ) -> Option<(Row, ReplicaInfo)> {
        let replica = self.replicas_matching(collection, Some(shard), replica_type).next()?.clone();
        let row = self.without_replica(&replica)?;
        Some((row, replica))
    }

    /// Returns a copy of this row without `replica`, or `None` if it is not
    /// hosted here.
    #[must_use]
    pub fn without_replica(&self, replica: &ReplicaInfo) -> Option<Row> {
        let replicas = self.replicas.get(&replica.collection)?.get(&replica.shard)?;
        let position = replicas.iter().position(|r| r.same_replica(replica))?;

        let mut row = self.clone();
        let shards = row.replicas.get_mut(&replica.collection)?;
        let list = shards.get_mut(&replica.shard)?;
        let removed = list.remove(position);
        if list.is_empty() {
            shards.shift_remove(&replica.shard);
        }
        if shards.is_empty() {
            row.replicas.shift_remove(&replica.collection);
        }
        row.adjust_usage(&removed, -1.0);
        Some(row)
    }

    fn adjust_usage(&mut self, replica: &ReplicaInfo, sign: f64) {
        if let Some(cores) = self.tags.get_mut("cores") {
            let next = match &*cores {
                TagValue::Int(n) => TagValue::Int(n + sign as i64),
                other => TagValue::Float(other.as_f64().unwrap_or(0.0) + sign),
            };
            *cores = next;
        }
        if let Some(size) = replica.size_gib() {
            if let Some(free) = self.tags.get_mut("freedisk") {
                if let Some(current) = free.as_f64() {
                    *free = TagValue::Float(current - sign * size);
                }
            }
        }
    }
}
