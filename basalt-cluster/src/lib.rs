//! Basalt cluster plane - everything that moves data and state between nodes
//!
//! Builds on the `basaltdb` core model (cluster state, routing tables,
//! operation routing) and adds:
//!
//! - **Transport**: typed, versioned request/response actions with an
//!   in-process implementation for single-node deployments and tests
//! - **Master**: the single-writer priority queue executing cluster-state
//!   updates, plus the pluggable state publisher
//! - **Close protocol**: the three-step add-block / verify / commit state
//!   machine closing tables and partitions
//! - **Discovery**: the peer finder probing master-eligible peers before
//!   the cluster has formed
//! - **Write path**: the row-to-shard grouper, the retrying write
//!   dispatcher, and update-to-insert folding for ON CONFLICT updates
//! - **Broadcast**: per-node fan-out of per-shard operations
//! - **Repurpose**: node data-directory layout and role-change cleanup

pub mod broadcast;
pub mod close;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod grouper;
pub mod jobs;
pub mod master;
pub mod metrics;
pub mod repurpose;
pub mod transport;
pub mod upsert;

pub use broadcast::{BroadcastByNode, BroadcastResponse, NodeBroadcastRequest, NodeBroadcastResponse};
pub use close::{Allocator, CloseTableRequest, CloseTableService, NoopAllocator, VerifyShardBeforeClose};
pub use config::ClusterConfig;
pub use discovery::{
    register_peers_handler, HostsProvider, PeerConnector, PeerEvent, PeerFinder, PeersRequest,
    PeersResponse, StaticHostsProvider,
};
pub use dispatch::{ShardWriteRequest, ShardWriteResponse, WriteDispatcher, WriteSummary};
pub use error::{ClusterError, Result};
pub use grouper::{GroupRowsByShard, IndexItem, ShardedRequests, SourceRow, TargetIndex};
pub use jobs::{JobRegistry, JobToken};
pub use master::{LocalPublisher, MasterService, Priority, StateObserver, StatePublisher};
pub use transport::{AcknowledgedResponse, LocalTransport, Transport, TransportAction};
pub use upsert::{Assignment, AssignmentValue, UpdateToInsert};
