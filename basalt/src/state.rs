//! Immutable cluster state
//!
//! A cluster state is a versioned snapshot of everything a node needs to
//! route: the node arena, the index metadata arena, the routing table, the
//! block set and the in-progress snapshot/restore sections. The master is
//! the single writer; every other node applies published states in version
//! order and never mutates one. Sub-trees are `Arc`-shared, so building a
//! new state clones only what actually changed.

use crate::blocks::ClusterBlocks;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::node::DiscoveryNodes;
use crate::routing::RoutingTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Indices currently being snapshotted, by uuid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsInProgress {
    indices: BTreeSet<String>,
}

impl SnapshotsInProgress {
    pub fn is_snapshotting(&self, index_uuid: &str) -> bool {
        self.indices.contains(index_uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn with_index(&self, index_uuid: impl Into<String>) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(index_uuid.into());
        Self { indices }
    }

    pub fn without_index(&self, index_uuid: &str) -> Self {
        let mut indices = self.indices.clone();
        indices.remove(index_uuid);
        Self { indices }
    }
}

/// Indices currently being restored, by uuid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoresInProgress {
    indices: BTreeSet<String>,
}

impl RestoresInProgress {
    pub fn is_restoring(&self, index_uuid: &str) -> bool {
        self.indices.contains(index_uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn with_index(&self, index_uuid: impl Into<String>) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(index_uuid.into());
        Self { indices }
    }

    pub fn without_index(&self, index_uuid: &str) -> Self {
        let mut indices = self.indices.clone();
        indices.remove(index_uuid);
        Self { indices }
    }
}

/// Immutable, versioned snapshot of cluster metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    version: u64,
    nodes: Arc<DiscoveryNodes>,
    metadata: Arc<Metadata>,
    routing_table: Arc<RoutingTable>,
    blocks: Arc<ClusterBlocks>,
    snapshots: Arc<SnapshotsInProgress>,
    restores: Arc<RestoresInProgress>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClusterState {
    pub fn builder() -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: 0,
            nodes: Arc::new(DiscoveryNodes::default()),
            metadata: Arc::new(Metadata::default()),
            routing_table: Arc::new(RoutingTable::default()),
            blocks: Arc::new(ClusterBlocks::default()),
            snapshots: Arc::new(SnapshotsInProgress::default()),
            restores: Arc::new(RestoresInProgress::default()),
        }
    }

    /// Start a builder that shares every unchanged sub-tree with `self`
    pub fn to_builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: self.version,
            nodes: Arc::clone(&self.nodes),
            metadata: Arc::clone(&self.metadata),
            routing_table: Arc::clone(&self.routing_table),
            blocks: Arc::clone(&self.blocks),
            snapshots: Arc::clone(&self.snapshots),
            restores: Arc::clone(&self.restores),
        }
    }

    /// Strictly increasing on the master; same version implies field-equal
    /// states (publisher contract)
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        &self.nodes
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn blocks(&self) -> &ClusterBlocks {
        &self.blocks
    }

    pub fn snapshots(&self) -> &SnapshotsInProgress {
        &self.snapshots
    }

    pub fn restores(&self) -> &RestoresInProgress {
        &self.restores
    }

    /// Rebuild with a different version and identical content
    pub fn with_version(&self, version: u64) -> ClusterState {
        let mut state = self.clone();
        state.version = version;
        state
    }

    /// Check the cross-tree invariants: every assigned shard copy's node
    /// must resolve in the node arena, every routed index must have
    /// metadata.
    pub fn validate(&self) -> Result<()> {
        for index in self.routing_table.indices() {
            if !self.metadata.has_index(index.index().uuid()) {
                return Err(Error::IllegalState(format!(
                    "routing for {} has no metadata",
                    index.index()
                )));
            }
            for copy in index.all_shards() {
                if let Some(node) = &copy.current_node_id {
                    if !self.nodes.contains(node) {
                        return Err(Error::IllegalState(format!(
                            "shard {} assigned to unknown node {node}",
                            copy.shard_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builder producing the next immutable state; copy-on-write per sub-tree
#[derive(Debug)]
pub struct ClusterStateBuilder {
    version: u64,
    nodes: Arc<DiscoveryNodes>,
    metadata: Arc<Metadata>,
    routing_table: Arc<RoutingTable>,
    blocks: Arc<ClusterBlocks>,
    snapshots: Arc<SnapshotsInProgress>,
    restores: Arc<RestoresInProgress>,
}

impl ClusterStateBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = Arc::new(nodes);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = Arc::new(routing_table);
        self
    }

    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.blocks = Arc::new(blocks);
        self
    }

    pub fn snapshots(mut self, snapshots: SnapshotsInProgress) -> Self {
        self.snapshots = Arc::new(snapshots);
        self
    }

    pub fn restores(mut self, restores: RestoresInProgress) -> Self {
        self.restores = Arc::new(restores);
        self
    }

    pub fn build(self) -> ClusterState {
        ClusterState {
            version: self.version,
            nodes: self.nodes,
            metadata: self.metadata,
            routing_table: self.routing_table,
            blocks: self.blocks,
            snapshots: self.snapshots,
            restores: self.restores,
        }
    }
}
