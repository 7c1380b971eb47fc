//! Broadcast-by-node fan-out
//!
//! Executes one logical per-shard operation across many shards with a
//! single request per node: the coordinator groups the selected shard
//! copies by their current node, each node runs the operation serially over
//! its shards, and the coordinator folds the node replies into one
//! response. Shards whose node is unknown to the coordinator's cluster
//! state are reported as not available rather than dispatched, and
//! shard-not-available failures on the node side are counted, not listed.

use crate::error::{ClusterError, Result};
use crate::metrics::record_broadcast;
use crate::transport::{actions, Transport};
use basalt::routing::ShardRouting;
use basalt::shard::ShardId;
use basalt::state::ClusterState;
use basalt::Error as CoreError;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// One failed shard operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardOperationFailure {
    pub shard_id: ShardId,
    pub error: ClusterError,
}

/// Aggregated request a node receives: its shards plus the logical request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBroadcastRequest<R> {
    pub shards: Vec<ShardId>,
    pub request: R,
}

/// One node's reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBroadcastResponse<S> {
    pub total: u32,
    pub successes: u32,
    pub unavailable: u32,
    pub results: Vec<S>,
    pub failures: Vec<ShardOperationFailure>,
}

/// Folded reply of a whole fan-out
#[derive(Debug, Clone)]
pub struct BroadcastResponse<S> {
    pub total: u32,
    pub successes: u32,
    /// Shards with no copy to dispatch to; transient, not failures
    pub unavailable: u32,
    pub failures: Vec<ShardOperationFailure>,
    pub results: Vec<S>,
}

/// Which shard copies a broadcast touches; defaults to every primary
pub type ShardSelector = fn(&ClusterState, &[String]) -> Vec<ShardRouting>;

/// The primary copy of every shard of the given indices
pub fn primary_shards(state: &ClusterState, index_uuids: &[String]) -> Vec<ShardRouting> {
    let mut selected = Vec::new();
    for uuid in index_uuids {
        if let Some(index) = state.routing_table().index(uuid) {
            for table in index.iter() {
                selected.push(table.primary_shard().clone());
            }
        }
    }
    selected
}

/// Generic per-node fan-out of a per-shard operation
pub struct BroadcastByNode<R, S> {
    action: String,
    transport: Arc<dyn Transport>,
    selector: ShardSelector,
    _marker: PhantomData<fn() -> (R, S)>,
}

impl<R, S> BroadcastByNode<R, S>
where
    R: Serialize + DeserializeOwned + Clone + Send + Sync,
    S: Serialize + DeserializeOwned + Send,
{
    pub fn new(base_action: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            action: actions::node_broadcast(base_action),
            transport,
            selector: primary_shards,
            _marker: PhantomData,
        }
    }

    /// Override which shard copies the broadcast touches
    pub fn with_selector(mut self, selector: ShardSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Fan the request out over the shards of `index_uuids` and fold the
    /// node replies
    pub async fn execute(
        &self,
        state: &ClusterState,
        index_uuids: &[String],
        request: R,
    ) -> BroadcastResponse<S> {
        let selected = (self.selector)(state, index_uuids);
        let total = selected.len() as u32;

        let mut by_node: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
        let mut unavailable = 0u32;
        for copy in selected {
            match &copy.current_node_id {
                Some(node) if state.nodes().contains(node) => {
                    by_node
                        .entry(node.clone())
                        .or_default()
                        .push(copy.shard_id.clone());
                }
                _ => unavailable += 1,
            }
        }
        debug!(
            "broadcasting {} over {} shards on {} nodes",
            self.action,
            total,
            by_node.len()
        );

        let sends = by_node.into_iter().map(|(node, shards)| {
            let request = NodeBroadcastRequest {
                shards,
                request: request.clone(),
            };
            async move {
                let reply = self.send_node_request(&node, &request).await;
                (request.shards, reply)
            }
        });

        let mut response = BroadcastResponse {
            total,
            successes: 0,
            unavailable,
            failures: Vec::new(),
            results: Vec::new(),
        };
        for (shards, reply) in join_all(sends).await {
            match reply {
                Ok(node_response) => {
                    response.successes += node_response.successes;
                    response.unavailable += node_response.unavailable;
                    response.failures.extend(node_response.failures);
                    response.results.extend(node_response.results);
                }
                // a failed node counts all its shards as failed
                Err(e) => {
                    for shard_id in shards {
                        response.failures.push(ShardOperationFailure {
                            shard_id,
                            error: e.clone(),
                        });
                    }
                }
            }
        }
        record_broadcast(
            &self.action,
            response.successes,
            response.failures.len() as u32,
            response.unavailable,
        );
        response
    }

    async fn send_node_request(
        &self,
        node_id: &str,
        request: &NodeBroadcastRequest<R>,
    ) -> Result<NodeBroadcastResponse<S>> {
        let payload = serde_json::to_vec(request)?;
        let raw = self
            .transport
            .send_raw(node_id, &self.action, payload)
            .await?;
        let reply: std::result::Result<NodeBroadcastResponse<S>, ClusterError> =
            serde_json::from_slice(&raw)?;
        reply
    }
}

/// Node side: run the shard operation serially over the shards this node
/// was handed. Shard-not-available errors are counted, not listed.
pub fn execute_node_request<R, S, F>(
    request: NodeBroadcastRequest<R>,
    mut operation: F,
) -> NodeBroadcastResponse<S>
where
    F: FnMut(&ShardId, &R) -> Result<S>,
{
    let mut response = NodeBroadcastResponse {
        total: request.shards.len() as u32,
        successes: 0,
        unavailable: 0,
        results: Vec::new(),
        failures: Vec::new(),
    };
    for shard_id in &request.shards {
        match operation(shard_id, &request.request) {
            Ok(result) => {
                response.successes += 1;
                response.results.push(result);
            }
            Err(ClusterError::Core(CoreError::ShardNotAvailable(_))) => {
                response.unavailable += 1;
            }
            Err(error) => response.failures.push(ShardOperationFailure {
                shard_id: shard_id.clone(),
                error,
            }),
        }
    }
    response
}

/// Wire a node-side broadcast handler into an in-process transport
pub fn register_node_handler<R, S, F>(
    transport: &crate::transport::LocalTransport,
    node_id: &str,
    base_action: &str,
    operation: F,
) where
    R: DeserializeOwned + Send + Sync + 'static,
    S: Serialize + Send + Sync + 'static,
    F: Fn(&ShardId, &R) -> Result<S> + Send + Sync + 'static,
{
    let operation = Arc::new(operation);
    transport.register_raw(
        node_id,
        &actions::node_broadcast(base_action),
        move |payload| {
            let operation = Arc::clone(&operation);
            Box::pin(async move {
                let reply: std::result::Result<NodeBroadcastResponse<S>, ClusterError> =
                    match serde_json::from_slice::<NodeBroadcastRequest<R>>(&payload) {
                        Ok(request) => Ok(execute_node_request(request, |shard, req| {
                            operation(shard, req)
                        })),
                        Err(e) => Err(ClusterError::Serialization(e.to_string())),
                    };
                serde_json::to_vec(&reply).unwrap_or_default()
            })
        },
    );
}
