//! Table/partition close protocol
//!
//! Closing is a three-step master state machine:
//!
//! 1. **Add block** - a transient write block (id 4, fresh uuid) lands on
//!    every open index of the table; fails outright while a snapshot or
//!    restore touches them.
//! 2. **Verify** - off the master thread, every shard copy is asked to
//!    flush and confirm it observes the block: primary first, then each
//!    replica. An index is acknowledged only if every copy confirmed.
//! 3. **Commit** - acknowledged indices swap the transient block for the
//!    canonical closed block and flip to CLOSE; indices that were deleted,
//!    already closed or lost their block in the meantime are ignored, and
//!    indices that started snapshotting drop out of the acknowledged set.
//!    On clusters where every node replicates closed indices the routing
//!    table is kept (copies re-initialize); older clusters drop the entry.
//!
//! After the commit the allocator reroutes and the caller waits, bounded by
//! the ack timeout, for each newly closed index to report an active shard.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::master::{MasterService, Priority, StateObserver};
use crate::metrics::record_close_step;
use crate::transport::{
    actions, send_request, AcknowledgedResponse, Transport, TransportAction,
};
use basalt::blocks::{index_closed_block, new_close_block, ClusterBlock, INDEX_CLOSED_BLOCK_ID};
use basalt::metadata::{IndexState, MetadataBuilder};
use basalt::node::CLOSED_INDICES_REPLICATED_VERSION;
use basalt::routing::RoutingTableBuilder;
use basalt::shard::ShardId;
use basalt::state::ClusterState;
use basalt::table::RelationName;
use basalt::Error as CoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Close a table, or one partition of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseTableRequest {
    pub table: RelationName,
    /// `Some` narrows the close to a single partition
    #[serde(default)]
    pub partition_values: Option<Vec<Option<String>>>,
}

impl TransportAction for CloseTableRequest {
    const NAME: &'static str = actions::CLOSE_TABLE;
    type Response = AcknowledgedResponse;
}

/// Ask a shard copy to flush and confirm it observes the close block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyShardBeforeClose {
    pub shard_id: ShardId,
    pub primary: bool,
    pub block: ClusterBlock,
}

impl TransportAction for VerifyShardBeforeClose {
    const NAME: &'static str = actions::VERIFY_SHARD_BEFORE_CLOSE;
    type Response = AcknowledgedResponse;
}

/// Re-runs shard allocation after a cluster-state change
pub trait Allocator: Send + Sync {
    fn reroute(&self, state: &ClusterState, reason: &str) -> basalt::Result<ClusterState>;
}

/// Allocator that leaves the routing table untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllocator;

impl Allocator for NoopAllocator {
    fn reroute(&self, state: &ClusterState, _reason: &str) -> basalt::Result<ClusterState> {
        Ok(state.clone())
    }
}

/// What the commit step decided, read back by the caller
#[derive(Debug, Default)]
struct CommitOutcome {
    closed: Vec<String>,
    dropped_from_ack: Vec<String>,
}

/// Orchestrates the close protocol from the coordinating master
pub struct CloseTableService {
    master: Arc<MasterService>,
    transport: Arc<dyn Transport>,
    allocator: Arc<dyn Allocator>,
    applied_states: watch::Receiver<Arc<ClusterState>>,
    config: ClusterConfig,
}

impl CloseTableService {
    pub fn new(
        master: Arc<MasterService>,
        transport: Arc<dyn Transport>,
        allocator: Arc<dyn Allocator>,
        applied_states: watch::Receiver<Arc<ClusterState>>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            master,
            transport,
            allocator,
            applied_states,
            config,
        }
    }

    pub async fn close_table(&self, request: CloseTableRequest) -> Result<AcknowledgedResponse> {
        // Step 1: block the open indices of the table
        let table = request.table.clone();
        let partition_values = request.partition_values.clone();
        let blocked_state = self
            .master
            .submit("add-block-close-table", Priority::Urgent, move |state| {
                add_close_blocks(state, &table, partition_values.as_deref())
            })
            .await
            .inspect_err(|_| record_close_step("add-block", "error"))?;
        record_close_step("add-block", "ok");

        let blocked = blocked_indices(&blocked_state, &request);
        if blocked.is_empty() {
            debug!("close of {}: nothing to do", request.table);
            return Ok(AcknowledgedResponse::acknowledged());
        }

        // Step 2: verify every shard copy observes the block (off the
        // master thread)
        let mut acked = BTreeMap::new();
        for (uuid, block) in &blocked {
            let result = self.verify_index_shards(&blocked_state, uuid, block).await;
            if let Err(e) = &result {
                warn!("close verification failed for index {uuid}: {e}");
            }
            record_close_step(
                "verify",
                if result.is_ok() { "ok" } else { "error" },
            );
            acked.insert(uuid.clone(), result.is_ok());
        }

        // Step 3: commit the close for acknowledged indices
        let blocked_uuids: BTreeMap<String, Option<String>> = blocked
            .iter()
            .map(|(uuid, block)| (uuid.clone(), block.uuid.clone()))
            .collect();
        let acked_for_commit = acked.clone();
        let allocator = Arc::clone(&self.allocator);
        let outcome = Arc::new(Mutex::new(CommitOutcome::default()));
        let outcome_for_commit = Arc::clone(&outcome);
        self.master
            .submit("close-indices", Priority::Urgent, move |state| {
                commit_closes(
                    state,
                    &blocked_uuids,
                    &acked_for_commit,
                    allocator.as_ref(),
                    &outcome_for_commit,
                )
            })
            .await
            .inspect_err(|_| record_close_step("commit", "error"))?;
        record_close_step("commit", "ok");

        let (closed, dropped) = {
            let outcome = outcome.lock();
            (outcome.closed.clone(), outcome.dropped_from_ack.clone())
        };
        info!(
            "closed {} index(es) of {} ({} dropped from ack)",
            closed.len(),
            request.table,
            dropped.len()
        );

        // Wait for each newly closed index to report an active shard again;
        // a timeout downgrades the ack but keeps the state changes.
        let mut observer = StateObserver::new(self.applied_states.clone());
        let wait = observer
            .wait_for(self.config.close_ack_timeout(), |state| {
                closed.iter().all(|uuid| match state.routing_table().index(uuid) {
                    Some(index) => index.iter().any(|t| t.has_active_shard()),
                    // legacy branch removed the entry, nothing to wait on
                    None => true,
                })
            })
            .await;
        if wait.is_err() {
            warn!("timed out waiting for active shards of closed indices");
            return Ok(AcknowledgedResponse::not_acknowledged());
        }

        let acknowledged = acked.values().all(|acked| *acked) && dropped.is_empty();
        Ok(AcknowledgedResponse {
            acknowledged,
        })
    }

    /// Two-phase per-shard verification: primary first, then every active
    /// replica copy
    async fn verify_index_shards(
        &self,
        state: &ClusterState,
        index_uuid: &str,
        block: &ClusterBlock,
    ) -> Result<()> {
        let index = state.routing_table().index(index_uuid).ok_or_else(|| {
            ClusterError::Core(CoreError::IndexNotFound(index_uuid.to_string()))
        })?;
        for table in index.iter() {
            let primary = table.primary_shard();
            let node = primary
                .current_node_id
                .as_ref()
                .filter(|_| primary.active())
                .ok_or_else(|| {
                    ClusterError::Core(CoreError::ShardNotAvailable(table.shard_id().clone()))
                })?;
            self.verify_one(node, table.shard_id(), true, block).await?;
            for replica in table.replica_shards() {
                if let (true, Some(node)) = (replica.active(), &replica.current_node_id) {
                    self.verify_one(node, table.shard_id(), false, block).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify_one(
        &self,
        node: &str,
        shard_id: &ShardId,
        primary: bool,
        block: &ClusterBlock,
    ) -> Result<()> {
        let request = VerifyShardBeforeClose {
            shard_id: shard_id.clone(),
            primary,
            block: block.clone(),
        };
        let response = send_request(self.transport.as_ref(), node, &request).await?;
        if response.acknowledged {
            Ok(())
        } else {
            Err(ClusterError::Internal(format!(
                "shard {shard_id} did not acknowledge the close block"
            )))
        }
    }
}

/// Step 1 task: add the transient write block to every open index of the
/// table, after checking nothing is being snapshotted or restored
pub(crate) fn add_close_blocks(
    state: &ClusterState,
    table: &RelationName,
    partition_values: Option<&[Option<String>]>,
) -> basalt::Result<ClusterState> {
    let open: Vec<&basalt::IndexMetadata> = state
        .metadata()
        .indices_of_table(table, partition_values)
        .into_iter()
        .filter(|m| m.state() == IndexState::Open)
        .collect();
    if open.is_empty() {
        return Ok(state.clone());
    }

    for meta in &open {
        if state.restores().is_restoring(meta.uuid()) {
            return Err(CoreError::IllegalArgument(format!(
                "cannot close index {} because it is being restored",
                meta.name()
            )));
        }
        if state.snapshots().is_snapshotting(meta.uuid()) {
            return Err(CoreError::SnapshotInProgress(meta.name().to_string()));
        }
    }

    let mut blocks = state.blocks().builder();
    for meta in &open {
        if state
            .blocks()
            .get_index_block(meta.uuid(), INDEX_CLOSED_BLOCK_ID)
            .is_none()
        {
            blocks.add_index_block(meta.uuid(), new_close_block(uuid::Uuid::new_v4().to_string()));
        }
    }
    Ok(state.to_builder().blocks(blocks.build()).build())
}

/// The `(uuid, block)` pairs step 1 left on the table's open indices
fn blocked_indices(
    state: &ClusterState,
    request: &CloseTableRequest,
) -> Vec<(String, ClusterBlock)> {
    state
        .metadata()
        .indices_of_table(&request.table, request.partition_values.as_deref())
        .into_iter()
        .filter(|m| m.state() == IndexState::Open)
        .filter_map(|m| {
            state
                .blocks()
                .get_index_block(m.uuid(), INDEX_CLOSED_BLOCK_ID)
                .map(|block| (m.uuid().to_string(), block.clone()))
        })
        .collect()
}

/// Step 3 task: flip acknowledged indices to CLOSE
pub(crate) fn commit_closes(
    state: &ClusterState,
    blocked: &BTreeMap<String, Option<String>>,
    acked: &BTreeMap<String, bool>,
    allocator: &dyn Allocator,
    outcome: &Mutex<CommitOutcome>,
) -> basalt::Result<ClusterState> {
    let mut metadata = MetadataBuilder::from(state.metadata());
    let mut routing = RoutingTableBuilder::from(state.routing_table());
    let mut blocks = state.blocks().builder();
    let min_version = state.nodes().min_protocol_version();
    let mut result = CommitOutcome::default();

    for (uuid, block_uuid) in blocked {
        // deleted in the meantime
        let Some(meta) = state.metadata().index(uuid) else {
            continue;
        };
        // already closed
        if meta.state() == IndexState::Close {
            continue;
        }
        // the block we verified was removed or replaced
        let Some(current) = state.blocks().get_index_block(uuid, INDEX_CLOSED_BLOCK_ID) else {
            continue;
        };
        if current.uuid != *block_uuid {
            continue;
        }
        // an index that stays open must not keep the transient write block
        if !acked.get(uuid).copied().unwrap_or(false) {
            blocks.remove_index_block_with_id(uuid, INDEX_CLOSED_BLOCK_ID);
            continue;
        }
        // started snapshotting or restoring since the verification
        if state.snapshots().is_snapshotting(uuid) || state.restores().is_restoring(uuid) {
            blocks.remove_index_block_with_id(uuid, INDEX_CLOSED_BLOCK_ID);
            result.dropped_from_ack.push(uuid.clone());
            continue;
        }

        blocks.remove_index_block_with_id(uuid, INDEX_CLOSED_BLOCK_ID);
        blocks.add_index_block(uuid, index_closed_block());

        if min_version < CLOSED_INDICES_REPLICATED_VERSION {
            // older nodes cannot host replicated closed indices
            routing.remove(uuid);
            metadata.put(meta.to_builder().state(IndexState::Close).build()?)?;
        } else {
            metadata.put(
                meta.to_builder()
                    .state(IndexState::Close)
                    .settings_version(meta.settings_version() + 1)
                    .verified_before_close(true)
                    .build()?,
            )?;
            if let Some(index_routing) = state.routing_table().index(uuid) {
                routing.add(index_routing.reinitialize_for_close()?);
            }
        }
        result.closed.push(uuid.clone());
    }

    let next = state
        .to_builder()
        .metadata(metadata.build())
        .routing_table(routing.build())
        .blocks(blocks.build())
        .build();
    let next = allocator.reroute(&next, "indices closed")?;
    *outcome.lock() = result;
    Ok(next)
}
