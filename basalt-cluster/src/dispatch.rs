//! Write dispatch
//!
//! Sends each `(shard, node)` batch produced by the grouper as one request
//! to the node owning the primary; that node replicates to the replicas and
//! reports `(successful, failed, total)` replica counts plus per-row
//! failures. Temporary errors (shard not available, an index looked up
//! right after its creation, broken connections) are retried against a
//! freshly read cluster state up to the configured count; block violations
//! and circuit-breaker trips surface immediately.

use crate::error::{ClusterError, Result};
use crate::grouper::{IndexItem, ShardedRequests, SourceInfo};
use crate::jobs::JobToken;
use crate::metrics::{record_dispatch_attempt, record_dispatch_retry, record_dispatch_rows};
use crate::transport::{actions, send_request, Transport, TransportAction};
use basalt::blocks::ClusterBlockLevel;
use basalt::shard::ShardId;
use basalt::state::ClusterState;
use basalt::Error as CoreError;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One batch of rows for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardWriteRequest {
    pub job_id: String,
    pub shard_id: ShardId,
    pub items: Vec<IndexItem>,
}

impl TransportAction for ShardWriteRequest {
    const NAME: &'static str = actions::SHARD_WRITE;
    type Response = ShardWriteResponse;
}

/// One failed row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFailure {
    pub id: String,
    pub source: Option<SourceInfo>,
    pub error: ClusterError,
}

/// Outcome of the primary-first replication of one batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub successful_replicas: u32,
    pub failed_replicas: u32,
    pub total: u32,
}

/// Reply of the shard engine for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardWriteResponse {
    pub successes: u32,
    pub failures: Vec<RowFailure>,
    pub replication: ReplicationSummary,
}

/// Per-source-uri failure rollup, for RETURN SUMMARY
#[derive(Debug, Clone, Default)]
pub struct UriSummary {
    pub count: u64,
    pub line_numbers: Vec<u64>,
    pub message: String,
}

/// Final outcome of one write statement
#[derive(Debug, Default)]
pub struct WriteSummary {
    pub success_count: u64,
    pub error_count: u64,
    pub failures: Vec<RowFailure>,
    /// Populated in return-summary mode; rows without a source land under
    /// `None`
    pub by_source_uri: HashMap<Option<String>, UriSummary>,
}

/// Dispatches sharded write batches to their owning nodes
pub struct WriteDispatcher {
    transport: Arc<dyn Transport>,
    states: watch::Receiver<Arc<ClusterState>>,
    temp_error_retries: u32,
    retry_base_delay: Duration,
}

impl WriteDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        states: watch::Receiver<Arc<ClusterState>>,
        temp_error_retries: u32,
    ) -> Self {
        Self {
            transport,
            states,
            temp_error_retries,
            retry_base_delay: Duration::from_millis(50),
        }
    }

    fn current_state(&self) -> Arc<ClusterState> {
        self.states.borrow().clone()
    }

    /// Send every batch, retrying temporary failures, and fold the replies
    /// into one summary. Returns `Err` only for errors that abort the whole
    /// statement: blocks, circuit breaking, cancellation.
    pub async fn execute(
        &self,
        requests: ShardedRequests,
        job: &JobToken,
        return_summary: bool,
    ) -> Result<WriteSummary> {
        let batches = requests.into_requests();
        let sends = batches.into_iter().map(|(location, items)| {
            let node_hint = location.node_id.clone();
            self.send_batch(location.shard_id, node_hint, items, job)
        });

        let mut summary = WriteSummary::default();
        for outcome in join_all(sends).await {
            let response = outcome?;
            summary.success_count += response.successes as u64;
            summary.error_count += response.failures.len() as u64;
            summary.failures.extend(response.failures);
        }
        record_dispatch_rows(summary.success_count, summary.error_count);

        if return_summary {
            for failure in &summary.failures {
                let entry = summary
                    .by_source_uri
                    .entry(failure.source.as_ref().map(|s| s.uri.clone()))
                    .or_default();
                entry.count += 1;
                if let Some(source) = &failure.source {
                    entry.line_numbers.push(source.line);
                }
                if entry.message.is_empty() {
                    entry.message = failure.error.to_string();
                }
            }
        }
        Ok(summary)
    }

    async fn send_batch(
        &self,
        shard_id: ShardId,
        node_hint: Option<String>,
        items: Vec<IndexItem>,
        job: &JobToken,
    ) -> Result<ShardWriteResponse> {
        let request = ShardWriteRequest {
            job_id: job.job_id().to_string(),
            shard_id: shard_id.clone(),
            items,
        };
        let mut node = node_hint;
        let mut last_error: Option<ClusterError> = None;

        for attempt in 0..=self.temp_error_retries {
            job.check()?;
            let state = self.current_state();
            // a write block on the index fails the statement immediately
            if let Err(e) = state
                .blocks()
                .check_index(ClusterBlockLevel::Write, shard_id.index_uuid())
            {
                return Err(e.into());
            }
            if attempt > 0 {
                node = primary_node(&state, &shard_id);
            }
            record_dispatch_attempt(attempt);

            let error = match &node {
                Some(node_id) => {
                    debug!(
                        "sending {} rows for {} to {node_id} (attempt {attempt})",
                        request.items.len(),
                        shard_id
                    );
                    match send_request(self.transport.as_ref(), node_id, &request).await {
                        Ok(response) => return Ok(response),
                        Err(e) => e,
                    }
                }
                None => ClusterError::Core(CoreError::ShardNotAvailable(shard_id.clone())),
            };

            if error.must_propagate() || matches!(error, ClusterError::Core(CoreError::Blocked { .. }))
            {
                return Err(error);
            }
            if !error.is_temporary() || attempt == self.temp_error_retries {
                last_error = Some(error);
                break;
            }
            warn!("temporary failure dispatching to {shard_id}, retrying: {error}");
            record_dispatch_retry(error.error_type());
            last_error = Some(error);
            tokio::time::sleep(self.retry_base_delay * (attempt + 1)).await;
        }

        // retries exhausted or permanent error: every row of the batch fails
        let error =
            last_error.unwrap_or_else(|| ClusterError::Internal("dispatch never attempted".into()));
        Ok(ShardWriteResponse {
            successes: 0,
            failures: request
                .items
                .into_iter()
                .map(|item| RowFailure {
                    id: item.id,
                    source: item.source,
                    error: error.clone(),
                })
                .collect(),
            replication: ReplicationSummary::default(),
        })
    }
}

/// Current node of a shard's primary: the copy itself while active, its
/// relocation target while moving, `None` while unassigned
fn primary_node(state: &ClusterState, shard_id: &ShardId) -> Option<String> {
    let table = state
        .routing_table()
        .shard_routing_table(shard_id.index_uuid(), shard_id.shard_number())
        .ok()?;
    let primary = table.primary_shard();
    if primary.active() {
        primary.current_node_id.clone()
    } else {
        primary.relocating_node_id.clone()
    }
}
