// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Operation descriptors handed to an external executor.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::suggester::{OperationKind, Suggestion};

/// A request an executor can send to the cluster's collections API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationDescriptor {
    /// What the operation does.
    pub kind: OperationKind,
    /// HTTP method.
    pub method: String,
    /// Request path, `/c/{collection}`.
    pub path: String,
    /// Command parameters.
    pub params: BTreeMap<String, String>,
}

impl OperationDescriptor {
    /// Creates a descriptor for `kind` on `collection` with no parameters.
    #[must_use]
    pub fn new(kind: OperationKind, collection: &str) -> Self {
        Self {
            kind,
            method: "POST".to_string(),
            path: format!("/c/{collection}"),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Renders `{method, path, command: {<kind>: params}}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut command = serde_json::Map::new();
        command.insert(self.kind.as_str().to_string(), json!(self.params));
        json!({
            "method": self.method,
            "path": self.path,
            "command": command,
        })
    }
}

impl Suggestion {
    /// Describes this suggestion as an executable operation.
    #[must_use]
    pub fn to_operation(&self) -> OperationDescriptor {
        let op = OperationDescriptor::new(self.kind(), self.collection())
            .with_param("collection", self.collection())
            .with_param("shard", self.shard())
            .with_param("type", self.replica_type().as_str());
        match self.kind() {
            OperationKind::AddReplica => op.with_param("node", self.target_node()),
            OperationKind::MoveReplica => {
                let mut op = op.with_param("targetNode", self.target_node());
                if let Some(source) = self.source_node() {
                    op = op.with_param("sourceNode", source);
                }
                if let Some(replica) = self.replica() {
                    op = op.with_param("replica", replica.name.as_str());
                }
                op
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json() {
        let op = OperationDescriptor::new(OperationKind::MoveReplica, "mycoll1")
            .with_param("replica", "r1")
            .with_param("targetNode", "node2");
        assert_eq!(
            op.to_json(),
            json!({
                "method": "POST",
                "path": "/c/mycoll1",
                "command": {"move-replica": {"replica": "r1", "targetNode": "node2"}}
            })
        );
    }

    #[test]
    fn test_descriptor_serialize() {
        let op = OperationDescriptor::new(OperationKind::AddReplica, "c1").with_param("node", "n1");
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["kind"], json!("add-replica"));
        assert_eq!(value["params"]["node"], json!("n1"));
    }
}
