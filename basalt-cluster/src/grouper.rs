//! Row-to-shard grouping
//!
//! Streams rows into per-shard write batches. For every row the grouper
//! evaluates the planner-supplied cell expressions eagerly (rows may be
//! backed by lazy sources that are expensive to re-read), resolves the
//! target index (computing the partition for partitioned tables), computes
//! the owning shard and the primary's node, checks the pre-insert
//! constraints, and files the item under `(shard, node)`.
//!
//! Rows whose partition does not exist yet are parked under the partition
//! values; after the auto-create round-trip, [`GroupRowsByShard::reresolve`]
//! places them against the fresh cluster state. Every row ends up in
//! exactly one of: a shard batch, the missing-partition queue, or the
//! failure recorder.

use crate::error::{ClusterError, Result};
use basalt::routing::OperationRouting;
use basalt::shard::ShardId;
use basalt::state::ClusterState;
use basalt::table::{PartitionName, RelationName};
use basalt::Error as CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Where a row came from, for per-source failure reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub uri: String,
    pub line: u64,
}

/// One raw input row plus its source position
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub cells: Vec<Value>,
    pub source: Option<SourceInfo>,
}

impl SourceRow {
    pub fn new(cells: Vec<Value>) -> Self {
        Self {
            cells,
            source: None,
        }
    }

    pub fn with_source(mut self, uri: impl Into<String>, line: u64) -> Self {
        self.source = Some(SourceInfo {
            uri: uri.into(),
            line,
        });
        self
    }
}

/// A cell expression supplied by the planner, evaluated against a raw row
pub type CellExpr = Arc<dyn Fn(&[Value]) -> basalt::Result<Value> + Send + Sync>;

/// Cell expression returning the raw cell at `index`
pub fn column_expr(index: usize) -> CellExpr {
    Arc::new(move |cells: &[Value]| {
        cells
            .get(index)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("row has no column {index}")))
    })
}

/// One row ready to be written to a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexItem {
    pub id: String,
    pub pk_values: Vec<Value>,
    pub auto_generated_timestamp: i64,
    pub values: Vec<Value>,
    #[serde(default)]
    pub source: Option<SourceInfo>,
}

/// Pre-insert checks the analyzer derives from the schema: unique primary
/// key, check constraints, NOT NULL, generated-column determinism. Runs
/// before any IO.
pub trait RowConstraints: Send + Sync {
    fn check(&self, item: &IndexItem) -> basalt::Result<()>;
}

/// No constraints (tables without schema-level checks)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConstraints;

impl RowConstraints for NoConstraints {
    fn check(&self, _item: &IndexItem) -> basalt::Result<()> {
        Ok(())
    }
}

/// Receives per-row failures instead of aborting the whole batch
pub trait FailureRecorder {
    fn record(&mut self, source: Option<&SourceInfo>, id: Option<&str>, error: ClusterError);
}

/// One recorded per-row failure
#[derive(Debug, Clone)]
pub struct RecordedFailure {
    pub source: Option<SourceInfo>,
    pub id: Option<String>,
    pub error: ClusterError,
}

/// Recorder collecting failures in memory
#[derive(Debug, Default)]
pub struct CollectingRecorder {
    pub failures: Vec<RecordedFailure>,
}

impl FailureRecorder for CollectingRecorder {
    fn record(&mut self, source: Option<&SourceInfo>, id: Option<&str>, error: ClusterError) {
        self.failures.push(RecordedFailure {
            source: source.cloned(),
            id: id.map(String::from),
            error,
        });
    }
}

/// The index a table's rows go to: fixed, or computed per partition
#[derive(Debug, Clone)]
pub enum TargetIndex {
    Fixed(String),
    Partitioned(RelationName),
}

impl TargetIndex {
    fn name_for(&self, partition_values: &[Option<String>]) -> String {
        match self {
            TargetIndex::Fixed(name) => name.clone(),
            TargetIndex::Partitioned(relation) => {
                PartitionName::new(relation.clone(), partition_values.to_vec()).index_name()
            }
        }
    }

    fn is_partitioned(&self) -> bool {
        matches!(self, TargetIndex::Partitioned(_))
    }
}

/// Destination of one write batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardLocation {
    pub shard_id: ShardId,
    /// Node of the primary copy; `None` falls back to broadcast dispatch
    pub node_id: Option<String>,
}

/// An item waiting for its partition to be created
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub item: IndexItem,
    pub routing: Option<String>,
}

/// Output of the grouper: per-(shard, node) batches plus rows parked on
/// missing partitions
#[derive(Debug, Default)]
pub struct ShardedRequests {
    requests: HashMap<ShardLocation, Vec<IndexItem>>,
    items_by_missing_partition: HashMap<Vec<Option<String>>, Vec<PendingItem>>,
}

impl ShardedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, location: ShardLocation, item: IndexItem) {
        self.requests.entry(location).or_default().push(item);
    }

    pub fn requests(&self) -> &HashMap<ShardLocation, Vec<IndexItem>> {
        &self.requests
    }

    pub fn into_requests(self) -> HashMap<ShardLocation, Vec<IndexItem>> {
        self.requests
    }

    pub fn item_count(&self) -> usize {
        self.requests.values().map(Vec::len).sum()
    }

    /// Partition values awaiting auto-create
    pub fn missing_partitions(&self) -> impl Iterator<Item = &Vec<Option<String>>> {
        self.items_by_missing_partition.keys()
    }

    pub fn has_missing_partitions(&self) -> bool {
        !self.items_by_missing_partition.is_empty()
    }

    pub fn pending_item_count(&self) -> usize {
        self.items_by_missing_partition.values().map(Vec::len).sum()
    }
}

/// Groups rows into per-shard write batches
pub struct GroupRowsByShard {
    target: TargetIndex,
    routing: OperationRouting,
    id_expr: CellExpr,
    routing_expr: Option<CellExpr>,
    partition_exprs: Vec<CellExpr>,
    pk_exprs: Vec<CellExpr>,
    output_exprs: Vec<CellExpr>,
    constraints: Arc<dyn RowConstraints>,
    auto_create: bool,
    propagate_error: bool,
    failed_uris: HashSet<String>,
    spare: Vec<Value>,
}

impl GroupRowsByShard {
    pub fn new(
        target: TargetIndex,
        routing: OperationRouting,
        id_expr: CellExpr,
        output_exprs: Vec<CellExpr>,
    ) -> Self {
        Self {
            target,
            routing,
            id_expr,
            routing_expr: None,
            partition_exprs: Vec::new(),
            pk_exprs: Vec::new(),
            output_exprs,
            constraints: Arc::new(NoConstraints),
            auto_create: false,
            propagate_error: false,
            failed_uris: HashSet::new(),
            spare: Vec::new(),
        }
    }

    pub fn with_routing_expr(mut self, expr: CellExpr) -> Self {
        self.routing_expr = Some(expr);
        self
    }

    pub fn with_partition_exprs(mut self, exprs: Vec<CellExpr>) -> Self {
        self.partition_exprs = exprs;
        self
    }

    pub fn with_pk_exprs(mut self, exprs: Vec<CellExpr>) -> Self {
        self.pk_exprs = exprs;
        self
    }

    pub fn with_constraints(mut self, constraints: Arc<dyn RowConstraints>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    pub fn propagate_error(mut self, enabled: bool) -> Self {
        self.propagate_error = enabled;
        self
    }

    /// Mark a source uri as failed; its remaining rows are dropped silently
    pub fn mark_source_failed(&mut self, uri: impl Into<String>) {
        self.failed_uris.insert(uri.into());
    }

    /// Place one row. Returns `Err` only for errors that must abort the
    /// statement (circuit breaking, or anything when `propagate_error`);
    /// everything else becomes a per-row failure.
    pub fn add_row(
        &mut self,
        state: &ClusterState,
        requests: &mut ShardedRequests,
        row: &SourceRow,
        recorder: &mut dyn FailureRecorder,
    ) -> Result<()> {
        if let Some(source) = &row.source {
            if self.failed_uris.contains(&source.uri) {
                return Ok(());
            }
        }

        let (item, routing_value, partition_values) = match self.evaluate_row(row) {
            Ok(evaluated) => evaluated,
            Err(error) => return self.fail(recorder, row.source.as_ref(), None, error),
        };

        let index_name = self.target.name_for(&partition_values);
        let metadata = match state.metadata().index_by_name(&index_name) {
            Some(metadata) => metadata,
            None => {
                if self.auto_create && self.target.is_partitioned() {
                    debug!("parking row for missing partition {index_name}");
                    requests
                        .items_by_missing_partition
                        .entry(partition_values)
                        .or_default()
                        .push(PendingItem {
                            routing: routing_value,
                            item,
                        });
                    return Ok(());
                }
                let id = item.id.clone();
                return self.fail(
                    recorder,
                    item.source.as_ref(),
                    Some(&id),
                    ClusterError::Core(CoreError::IndexNotFound(index_name)),
                );
            }
        };

        let location = match resolve_shard_location(
            &self.routing,
            state,
            metadata.uuid(),
            &item.id,
            routing_value.as_deref(),
        ) {
            Ok(location) => location,
            Err(error) => {
                let id = item.id.clone();
                return self.fail(recorder, item.source.as_ref(), Some(&id), error.into());
            }
        };

        // pre-insert constraints run once the location resolves, before IO
        if let Err(error) = self.constraints.check(&item) {
            let id = item.id.clone();
            return self.fail(recorder, item.source.as_ref(), Some(&id), error.into());
        }
        requests.push(location, item);
        Ok(())
    }

    /// Second pass after partition auto-create: place every parked item
    /// against the fresh cluster state. An unresolvable location here is a
    /// programming bug, not a user error.
    pub fn reresolve(
        &self,
        state: &ClusterState,
        requests: &mut ShardedRequests,
        recorder: &mut dyn FailureRecorder,
    ) -> Result<()> {
        let pending = std::mem::take(&mut requests.items_by_missing_partition);
        for (partition_values, items) in pending {
            let index_name = self.target.name_for(&partition_values);
            let metadata = state.metadata().index_by_name(&index_name).ok_or_else(|| {
                ClusterError::Core(CoreError::IllegalState(
                    "shardLocation not resolvable after createIndices".into(),
                ))
            })?;
            for pending_item in items {
                let location = resolve_shard_location(
                    &self.routing,
                    state,
                    metadata.uuid(),
                    &pending_item.item.id,
                    pending_item.routing.as_deref(),
                )
                .map_err(|_| {
                    ClusterError::Core(CoreError::IllegalState(
                        "shardLocation not resolvable after createIndices".into(),
                    ))
                })?;
                let item = pending_item.item;
                if let Err(error) = self.constraints.check(&item) {
                    let id = item.id.clone();
                    recorder.record(item.source.as_ref(), Some(&id), error.into());
                    continue;
                }
                requests.push(location, item);
            }
        }
        Ok(())
    }

    fn evaluate_row(
        &mut self,
        row: &SourceRow,
    ) -> Result<(IndexItem, Option<String>, Vec<Option<String>>)> {
        let id = required_string((self.id_expr)(&row.cells)?)?;
        let routing_value = match &self.routing_expr {
            Some(expr) => optional_string(expr(&row.cells)?),
            None => None,
        };
        let mut partition_values = Vec::with_capacity(self.partition_exprs.len());
        for expr in &self.partition_exprs {
            partition_values.push(optional_string(expr(&row.cells)?));
        }
        let mut pk_values = Vec::with_capacity(self.pk_exprs.len());
        for expr in &self.pk_exprs {
            pk_values.push(expr(&row.cells)?);
        }
        // evaluate eagerly into the spare buffer: the backing source may be
        // lazy and expensive to re-read
        self.spare.clear();
        for expr in &self.output_exprs {
            self.spare.push(expr(&row.cells)?);
        }
        let item = IndexItem {
            id,
            pk_values,
            auto_generated_timestamp: unix_millis(),
            values: self.spare.clone(),
            source: row.source.clone(),
        };
        Ok((item, routing_value, partition_values))
    }

    fn fail(
        &self,
        recorder: &mut dyn FailureRecorder,
        source: Option<&SourceInfo>,
        id: Option<&str>,
        error: ClusterError,
    ) -> Result<()> {
        if error.must_propagate() || self.propagate_error {
            return Err(error);
        }
        recorder.record(source, id, error);
        Ok(())
    }
}

/// Resolve the node that should receive a write for `id`: the first
/// assigned copy in primary-first order; a copy that is not yet active
/// points at its relocation target; no assigned copy means broadcast
/// fallback (`node_id: None`).
fn resolve_shard_location(
    routing: &OperationRouting,
    state: &ClusterState,
    index_uuid: &str,
    id: &str,
    routing_value: Option<&str>,
) -> basalt::Result<ShardLocation> {
    let mut copies = routing.index_shards(state, index_uuid, id, routing_value)?;
    let shard_id = copies.shard_id().clone();
    while let Some(copy) = copies.next_or_none() {
        if copy.assigned() {
            let node_id = if copy.active() {
                copy.current_node_id
            } else {
                copy.relocating_node_id
            };
            return Ok(ShardLocation { shard_id, node_id });
        }
    }
    Ok(ShardLocation {
        shard_id,
        node_id: None,
    })
}

fn required_string(value: Value) -> Result<String> {
    optional_string(value).ok_or_else(|| {
        ClusterError::Core(CoreError::Validation("document id must not be null".into()))
    })
}

fn optional_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt::metadata::{IndexMetadata, MetadataBuilder};
    use basalt::node::{DiscoveryNode, DiscoveryNodes};
    use basalt::routing::{
        IndexRoutingTable, IndexShardRoutingTable, RoutingTable, ShardRouting,
    };
    use basalt::shard::Index;
    use proptest::prelude::*;
    use serde_json::json;

    fn started_index(name: &str, uuid: &str, shards: u32, node: &str) -> (IndexMetadata, IndexRoutingTable) {
        let meta = IndexMetadata::builder(Index::new(name, uuid))
            .number_of_shards(shards)
            .build()
            .unwrap();
        let mut builder = IndexRoutingTable::builder(meta.index().clone());
        for number in 0..shards {
            let shard_id = ShardId::new(meta.index().clone(), number);
            let primary = ShardRouting::unassigned(shard_id.clone(), true, "new")
                .initialize(node)
                .start();
            builder.add_shard_table(IndexShardRoutingTable::new(shard_id, vec![primary]).unwrap());
        }
        (meta, builder.build())
    }

    fn state_of(indices: Vec<(IndexMetadata, IndexRoutingTable)>) -> ClusterState {
        let mut metadata = MetadataBuilder::default();
        let mut routing = RoutingTable::builder();
        for (meta, table) in indices {
            metadata.put(meta).unwrap();
            routing.add(table);
        }
        let mut nodes = DiscoveryNodes::builder();
        nodes
            .add(DiscoveryNode::new("n1", "node-1", "a:1"))
            .add(DiscoveryNode::new("n2", "node-2", "b:1"));
        ClusterState::builder()
            .nodes(nodes.build())
            .metadata(metadata.build())
            .routing_table(routing.build())
            .build()
    }

    fn plain_grouper() -> GroupRowsByShard {
        GroupRowsByShard::new(
            TargetIndex::Fixed("doc.t".into()),
            OperationRouting::default(),
            column_expr(0),
            vec![column_expr(0), column_expr(1)],
        )
    }

    fn partitioned_grouper() -> GroupRowsByShard {
        // table doc.p partitioned by (day); row layout: [day, id, payload]
        GroupRowsByShard::new(
            TargetIndex::Partitioned(RelationName::new("doc", "p")),
            OperationRouting::default(),
            column_expr(1),
            vec![column_expr(1), column_expr(2)],
        )
        .with_partition_exprs(vec![column_expr(0)])
        .auto_create(true)
    }

    #[test]
    fn test_rows_group_by_shard_and_node() {
        let state = state_of(vec![started_index("doc.t", "u-1", 2, "n1")]);
        let mut grouper = plain_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        for id in ["a", "b", "c", "d"] {
            let row = SourceRow::new(vec![json!(id), json!(1)]);
            grouper
                .add_row(&state, &mut requests, &row, &mut recorder)
                .unwrap();
        }

        assert_eq!(requests.item_count(), 4);
        assert!(recorder.failures.is_empty());
        for (location, items) in requests.requests() {
            assert_eq!(location.node_id.as_deref(), Some("n1"));
            assert!(!items.is_empty());
        }
    }

    #[test]
    fn test_relocating_copy_targets_relocation_node() {
        let meta = IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(1)
            .build()
            .unwrap();
        let shard_id = ShardId::new(meta.index().clone(), 0);
        // primary initializing towards a relocation target
        let primary = ShardRouting {
            shard_id: shard_id.clone(),
            primary: true,
            state: basalt::routing::ShardRoutingState::Initializing,
            current_node_id: Some("n1".into()),
            relocating_node_id: Some("n2".into()),
            unassigned_reason: None,
        };
        let mut builder = IndexRoutingTable::builder(meta.index().clone());
        builder.add_shard_table(IndexShardRoutingTable::new(shard_id, vec![primary]).unwrap());
        let state = state_of(vec![(meta, builder.build())]);

        let location =
            resolve_shard_location(&OperationRouting::default(), &state, "u-1", "x", None)
                .unwrap();
        assert_eq!(location.node_id.as_deref(), Some("n2"));
    }

    #[test]
    fn test_unassigned_shard_falls_back_to_broadcast() {
        let meta = IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(1)
            .build()
            .unwrap();
        let routing = IndexRoutingTable::new_unassigned(&meta, "new").unwrap();
        let state = state_of(vec![(meta, routing)]);

        let location =
            resolve_shard_location(&OperationRouting::default(), &state, "u-1", "x", None)
                .unwrap();
        assert!(location.node_id.is_none());
    }

    #[test]
    fn test_missing_partition_parks_items() {
        let state = state_of(vec![]);
        let mut grouper = partitioned_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let row = SourceRow::new(vec![json!("2024-01-01"), json!("x"), json!("payload")]);
        grouper
            .add_row(&state, &mut requests, &row, &mut recorder)
            .unwrap();

        assert_eq!(requests.item_count(), 0);
        assert!(requests.has_missing_partitions());
        assert_eq!(requests.pending_item_count(), 1);
        let partitions: Vec<_> = requests.missing_partitions().collect();
        assert_eq!(partitions, vec![&vec![Some("2024-01-01".to_string())]]);
        assert!(recorder.failures.is_empty());
    }

    #[test]
    fn test_reresolve_places_parked_items() {
        let mut grouper = partitioned_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let empty = state_of(vec![]);
        let row = SourceRow::new(vec![json!("2024-01-01"), json!("x"), json!("payload")]);
        grouper
            .add_row(&empty, &mut requests, &row, &mut recorder)
            .unwrap();

        // auto-create produced the partition index on n2
        let partition =
            PartitionName::new(RelationName::new("doc", "p"), vec![Some("2024-01-01".into())]);
        let created = state_of(vec![started_index(&partition.index_name(), "u-p1", 2, "n2")]);

        grouper
            .reresolve(&created, &mut requests, &mut recorder)
            .unwrap();
        assert!(!requests.has_missing_partitions());
        assert_eq!(requests.item_count(), 1);
        let (location, items) = requests.requests().iter().next().unwrap();
        assert_eq!(location.node_id.as_deref(), Some("n2"));
        assert_eq!(location.shard_id.index_uuid(), "u-p1");
        assert_eq!(items[0].id, "x");
    }

    #[test]
    fn test_reresolve_missing_index_is_illegal_state() {
        let mut grouper = partitioned_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let empty = state_of(vec![]);
        let row = SourceRow::new(vec![json!("2024-01-01"), json!("x"), json!("payload")]);
        grouper
            .add_row(&empty, &mut requests, &row, &mut recorder)
            .unwrap();

        let err = grouper
            .reresolve(&empty, &mut requests, &mut recorder)
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Core(CoreError::IllegalState(msg))
                if msg == "shardLocation not resolvable after createIndices"
        ));
    }

    #[test]
    fn test_missing_index_without_auto_create_is_recorded() {
        let state = state_of(vec![]);
        let mut grouper = plain_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let row = SourceRow::new(vec![json!("a"), json!(1)]);
        grouper
            .add_row(&state, &mut requests, &row, &mut recorder)
            .unwrap();
        assert_eq!(recorder.failures.len(), 1);
        assert_eq!(recorder.failures[0].error.error_type(), "index_not_found");
    }

    #[test]
    fn test_failed_uri_rows_dropped_without_error() {
        let state = state_of(vec![started_index("doc.t", "u-1", 1, "n1")]);
        let mut grouper = plain_grouper();
        grouper.mark_source_failed("file:///part-0.csv");
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let row =
            SourceRow::new(vec![json!("a"), json!(1)]).with_source("file:///part-0.csv", 7);
        grouper
            .add_row(&state, &mut requests, &row, &mut recorder)
            .unwrap();
        assert_eq!(requests.item_count(), 0);
        assert!(recorder.failures.is_empty());

        let healthy =
            SourceRow::new(vec![json!("b"), json!(1)]).with_source("file:///part-1.csv", 1);
        grouper
            .add_row(&state, &mut requests, &healthy, &mut recorder)
            .unwrap();
        assert_eq!(requests.item_count(), 1);
    }

    #[test]
    fn test_expression_failure_is_recorded_per_row() {
        let state = state_of(vec![started_index("doc.t", "u-1", 1, "n1")]);
        let mut grouper = plain_grouper();
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        // row too short for column 1
        let row = SourceRow::new(vec![json!("a")]).with_source("file:///p.csv", 3);
        grouper
            .add_row(&state, &mut requests, &row, &mut recorder)
            .unwrap();
        assert_eq!(recorder.failures.len(), 1);
        assert_eq!(
            recorder.failures[0].source.as_ref().unwrap().line,
            3
        );
    }

    #[test]
    fn test_circuit_breaker_propagates() {
        let state = state_of(vec![started_index("doc.t", "u-1", 1, "n1")]);
        let breaking: CellExpr =
            Arc::new(|_cells| Err(CoreError::CircuitBreaking("over limit".into())));
        let mut grouper = GroupRowsByShard::new(
            TargetIndex::Fixed("doc.t".into()),
            OperationRouting::default(),
            column_expr(0),
            vec![breaking],
        );
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let err = grouper
            .add_row(
                &state,
                &mut requests,
                &SourceRow::new(vec![json!("a")]),
                &mut recorder,
            )
            .unwrap_err();
        assert!(err.must_propagate());
        assert!(recorder.failures.is_empty());
    }

    #[test]
    fn test_propagate_error_mode() {
        let state = state_of(vec![]);
        let mut grouper = plain_grouper().propagate_error(true);
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        let err = grouper
            .add_row(
                &state,
                &mut requests,
                &SourceRow::new(vec![json!("a"), json!(1)]),
                &mut recorder,
            )
            .unwrap_err();
        assert_eq!(err.error_type(), "index_not_found");
    }

    #[test]
    fn test_constraint_violation_is_recorded() {
        struct NotNullPayload;
        impl RowConstraints for NotNullPayload {
            fn check(&self, item: &IndexItem) -> basalt::Result<()> {
                if item.values.get(1) == Some(&Value::Null) {
                    Err(CoreError::Validation("payload must not be null".into()))
                } else {
                    Ok(())
                }
            }
        }

        let state = state_of(vec![started_index("doc.t", "u-1", 1, "n1")]);
        let mut grouper = plain_grouper().with_constraints(Arc::new(NotNullPayload));
        let mut requests = ShardedRequests::new();
        let mut recorder = CollectingRecorder::default();

        grouper
            .add_row(
                &state,
                &mut requests,
                &SourceRow::new(vec![json!("a"), json!(null)]),
                &mut recorder,
            )
            .unwrap();
        assert_eq!(requests.item_count(), 0);
        assert_eq!(recorder.failures.len(), 1);
        assert_eq!(recorder.failures[0].error.error_type(), "validation");
    }

    proptest! {
        /// Every row lands in exactly one of: a shard batch, the
        /// missing-partition queue, or the failure recorder.
        #[test]
        fn prop_partition_is_total_and_disjoint(
            rows in prop::collection::vec(
                (prop_oneof![Just("2024-01-01"), Just("2024-02-02"), Just("bad")],
                 "[a-z]{0,6}"),
                0..40,
            )
        ) {
            let partition = PartitionName::new(
                RelationName::new("doc", "p"),
                vec![Some("2024-01-01".into())],
            );
            let state = state_of(vec![started_index(&partition.index_name(), "u-p1", 3, "n1")]);

            // "bad" partition values make the partition expression fail;
            // empty ids fail id evaluation
            let failing_partition: CellExpr = Arc::new(|cells: &[Value]| {
                match &cells[0] {
                    Value::String(s) if s == "bad" => {
                        Err(CoreError::Validation("bad partition".into()))
                    }
                    other => Ok(other.clone()),
                }
            });
            let id_expr: CellExpr = Arc::new(|cells: &[Value]| match &cells[1] {
                Value::String(s) if s.is_empty() => Ok(Value::Null),
                other => Ok(other.clone()),
            });
            let mut grouper = GroupRowsByShard::new(
                TargetIndex::Partitioned(RelationName::new("doc", "p")),
                OperationRouting::default(),
                id_expr,
                vec![column_expr(1)],
            )
            .with_partition_exprs(vec![failing_partition])
            .auto_create(true);

            let mut requests = ShardedRequests::new();
            let mut recorder = CollectingRecorder::default();
            for (day, id) in &rows {
                let row = SourceRow::new(vec![json!(day), json!(id)]);
                grouper.add_row(&state, &mut requests, &row, &mut recorder).unwrap();
            }

            prop_assert_eq!(
                requests.item_count() + requests.pending_item_count() + recorder.failures.len(),
                rows.len()
            );
        }
    }
}
