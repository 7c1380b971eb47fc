//! Basalt core - data model and shard routing for a distributed SQL database
//!
//! This crate holds everything a node needs to decide *where* data lives:
//!
//! - **Identity**: index `(name, uuid)` pairs and `ShardId`s
//! - **Cluster state**: immutable versioned snapshots with copy-on-write
//!   builders, produced by the master and applied in order everywhere
//! - **Routing table**: shard → copies (one primary, replicas) with their
//!   states, plus the preference-aware copy iterators
//! - **Operation routing**: the deterministic document → shard function
//! - **Blocks**: read/write/metadata blocks, including the closed-index block
//! - **Tables**: relations, partitions and the reversible partition ident
//!
//! The cluster plane (transport, discovery, close protocol, write dispatch)
//! lives in the `basaltdb-cluster` crate on top of these types.

pub mod blocks;
pub mod error;
pub mod metadata;
pub mod node;
pub mod routing;
pub mod settings;
pub mod shard;
pub mod state;
pub mod table;

pub use blocks::{ClusterBlock, ClusterBlockLevel, ClusterBlocks, INDEX_CLOSED_BLOCK_ID};
pub use error::{Error, Result};
pub use metadata::{IndexMetadata, IndexState, Metadata};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeRole, PROTOCOL_VERSION};
pub use routing::{
    IndexRoutingTable, IndexShardRoutingTable, OperationRouting, RoutingTable, ShardIterator,
    ShardRouting, ShardRoutingState,
};
pub use settings::{Setting, SettingScope, Settings};
pub use shard::{Index, ShardId};
pub use state::{ClusterState, RestoresInProgress, SnapshotsInProgress};
pub use table::{ColumnInfo, PartitionName, RelationName, TableInfo};
