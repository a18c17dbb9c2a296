// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Declarative replica placement policies.
//!
//! This crate evaluates a placement policy against a snapshot of the cluster
//! and suggests where new replicas should go and which replicas should move.
//!
//! # Overview
//!
//! A policy is a JSON document of three parts:
//! - `cluster-policy`: clauses every collection must satisfy
//! - `policies`: named clause lists attached to individual collections
//! - `cluster-preferences`: the order in which nodes are tried
//!
//! A clause bounds how many replicas a node (or a group of nodes sharing an
//! attribute value) may host, e.g. `{"replica": "<2", "shard": "#EACH",
//! "node": "#ANY"}`, or bounds a node attribute directly, e.g.
//! `{"cores": "<10", "node": "#ANY"}`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   ┌────────────────────┐
//! │ ClusterStateProvider│   │ NodeStateProvider  │   (caller supplied)
//! └─────────┬──────────┘   └─────────┬──────────┘
//!           └──────────┬─────────────┘
//!                 ┌────┴────┐
//!                 │ Session │  rows sorted by preferences + violations
//!                 └────┬────┘
//!                 ┌────┴──────┐
//!                 │ Suggester │  one add/move at a time, copy-on-write
//!                 └────┬──────┘
//!                 ┌────┴─────────┐
//!                 │ PolicyHelper │  bulk placement, repair batches, cache
//!                 └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use rucket_placement::{InMemoryCluster, PlacementRequest, Policy, PolicyHelper};
//! use serde_json::json;
//!
//! let cluster = Arc::new(
//!     InMemoryCluster::new()
//!         .with_node("node1", [("cores", json!(12))])
//!         .with_node("node2", [("cores", json!(4))])
//!         .with_node("node3", [("cores", json!(7))])
//!         .with_node("node4", [("cores", json!(8)), ("nodeRole", json!("overseer"))]),
//! );
//!
//! let policy = Arc::new(
//!     Policy::parse(
//!         r##"{
//!             "cluster-policy": [
//!                 {"replica": 0, "nodeRole": "overseer"},
//!                 {"replica": "<2", "shard": "#EACH", "node": "#ANY"}
//!             ],
//!             "cluster-preferences": [{"minimize": "cores"}]
//!         }"##,
//!     )
//!     .unwrap(),
//! );
//!
//! let helper = PolicyHelper::new(cluster.clone(), cluster);
//! let request = PlacementRequest::new("mycoll", ["shard1"]).with_replicas(1, 0, 0);
//! let positions = helper.replica_locations(&policy, &request).unwrap();
//! assert_eq!(positions[0].node, "node2");
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod clause;
pub mod config;
pub mod error;
pub mod helper;
pub mod operand;
pub mod operation;
pub mod policy;
pub mod preference;
pub mod provider;
pub mod row;
pub mod session;
pub mod suggester;
pub mod value;
pub mod variable;
pub mod violation;

pub use cache::{SessionCache, SessionLease, SessionScope};
pub use clause::{Clause, CollectionScope, ShardScope};
pub use config::EngineConfig;
pub use error::{BoxError, PolicyError, Result};
pub use helper::{collect_suggestions, place_replicas, PlacementRequest, PolicyHelper, ReplicaPosition, SuggestionInfo};
pub use operand::{Condition, Operand};
pub use operation::OperationDescriptor;
pub use policy::Policy;
pub use preference::{Direction, Preference};
pub use provider::{ClusterSnapshot, ClusterStateProvider, InMemoryCluster, NodeStateProvider};
pub use row::{ReplicaInfo, ReplicaType, Row};
pub use session::Session;
pub use suggester::{Hint, OperationKind, Suggester, Suggestion};
pub use value::TagValue;
pub use violation::Violation;
