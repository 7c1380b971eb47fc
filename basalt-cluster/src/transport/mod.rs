//! Typed node-to-node transport
//!
//! Every RPC is a named action with a serde request and response; payloads
//! are JSON frames on the wire, and forward-compatible additions append
//! `#[serde(default)]` fields. The transport itself is pluggable: the
//! in-process [`LocalTransport`] backs single-process clusters and tests,
//! a network implementation plugs in behind the same trait.

mod local;

pub use local::LocalTransport;

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Stable internal action names
pub mod actions {
    /// Close a table or a single partition
    pub const CLOSE_TABLE: &str = "internal:crate:sql/table_or_partition/close";

    /// Verify a shard observes the close block and has flushed
    pub const VERIFY_SHARD_BEFORE_CLOSE: &str = "internal:indices:admin/close/verify_shard";

    /// Peer discovery exchange
    pub const REQUEST_PEERS: &str = "internal:discovery/request_peers";

    /// Per-shard write batch
    pub const SHARD_WRITE: &str = "internal:crate:sql/data/write";

    /// Per-node handler of a broadcast action
    pub fn node_broadcast(base: &str) -> String {
        format!("{base}[n]")
    }
}

/// A request type bound to an action name and response type
pub trait TransportAction: Serialize + DeserializeOwned + Send + Sync {
    const NAME: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Node-addressed request/response transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `action` on `node_id`; the reply carries either the
    /// encoded response or the remote error.
    async fn send_raw(&self, node_id: &str, action: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Send a typed request and decode the typed response
pub async fn send_request<A: TransportAction>(
    transport: &dyn Transport,
    node_id: &str,
    request: &A,
) -> Result<A::Response> {
    send_to_action::<A>(transport, node_id, A::NAME, request).await
}

/// Send a typed request to an explicit action name (broadcast `[n]` handlers)
pub async fn send_to_action<A: TransportAction>(
    transport: &dyn Transport,
    node_id: &str,
    action: &str,
    request: &A,
) -> Result<A::Response> {
    let payload = serde_json::to_vec(request)?;
    let raw = transport.send_raw(node_id, action, payload).await?;
    let reply: std::result::Result<A::Response, ClusterError> = serde_json::from_slice(&raw)?;
    reply
}

/// Ubiquitous master-operation reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgedResponse {
    pub acknowledged: bool,
}

impl AcknowledgedResponse {
    pub fn acknowledged() -> Self {
        Self { acknowledged: true }
    }

    pub fn not_acknowledged() -> Self {
        Self {
            acknowledged: false,
        }
    }
}
