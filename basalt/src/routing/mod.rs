//! Shard routing tables
//!
//! The routing table maps every index uuid to its shards and every shard to
//! its copies: exactly one primary plus replicas, each copy either assigned
//! to a node or unassigned with a reason. Tables are immutable values inside
//! a cluster state; builders produce new tables.

pub mod hash;
pub mod iterator;
pub mod operation;

pub use iterator::ShardIterator;
pub use operation::OperationRouting;

use crate::error::{Error, Result};
use crate::metadata::IndexMetadata;
use crate::node::DiscoveryNodes;
use crate::shard::{Index, ShardId};
use iterator::rotate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// State of a single shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// One copy of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,

    /// Node hosting this copy; `None` while unassigned
    pub current_node_id: Option<String>,

    /// Target node while relocating
    pub relocating_node_id: Option<String>,

    /// Why the copy is unassigned
    pub unassigned_reason: Option<String>,
}

impl ShardRouting {
    /// A fresh unassigned copy
    pub fn unassigned(shard_id: ShardId, primary: bool, reason: impl Into<String>) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node_id: None,
            relocating_node_id: None,
            unassigned_reason: Some(reason.into()),
        }
    }

    /// Assign the copy to a node and start recovery
    pub fn initialize(&self, node_id: impl Into<String>) -> Self {
        Self {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            current_node_id: Some(node_id.into()),
            relocating_node_id: None,
            unassigned_reason: None,
        }
    }

    /// Recovery finished; the copy serves traffic
    pub fn start(&self) -> Self {
        Self {
            state: ShardRoutingState::Started,
            relocating_node_id: None,
            ..self.clone()
        }
    }

    /// Begin relocation towards `target`
    pub fn relocate(&self, target: impl Into<String>) -> Self {
        Self {
            state: ShardRoutingState::Relocating,
            relocating_node_id: Some(target.into()),
            ..self.clone()
        }
    }

    /// Started or relocating copies serve reads and writes
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    pub fn assigned(&self) -> bool {
        self.current_node_id.is_some()
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    /// Is this copy hosted on `node_id`
    pub fn on_node(&self, node_id: &str) -> bool {
        self.current_node_id.as_deref() == Some(node_id)
    }
}

/// All copies of one shard, with precomputed iteration orders
#[derive(Debug, Clone)]
pub struct IndexShardRoutingTable {
    shard_id: ShardId,
    shards: Vec<ShardRouting>,
    /// Active copies followed by assigned initializing copies
    active_initializing: Vec<ShardRouting>,
    /// Shared rotation counter behind the "random" iterator order
    rotation: Arc<AtomicUsize>,
}

impl PartialEq for IndexShardRoutingTable {
    fn eq(&self, other: &Self) -> bool {
        self.shard_id == other.shard_id && self.shards == other.shards
    }
}

impl Eq for IndexShardRoutingTable {}

impl IndexShardRoutingTable {
    /// Build a shard group; there must be exactly one primary copy.
    pub fn new(shard_id: ShardId, shards: Vec<ShardRouting>) -> Result<Self> {
        let primaries = shards.iter().filter(|s| s.primary).count();
        if primaries != 1 {
            return Err(Error::IllegalState(format!(
                "shard {shard_id} has {primaries} primary copies"
            )));
        }
        if let Some(stray) = shards.iter().find(|s| s.shard_id != shard_id) {
            return Err(Error::IllegalState(format!(
                "copy of {} added to group of {shard_id}",
                stray.shard_id
            )));
        }
        let mut active_initializing: Vec<ShardRouting> =
            shards.iter().filter(|s| s.active()).cloned().collect();
        active_initializing
            .extend(shards.iter().filter(|s| s.initializing() && s.assigned()).cloned());
        Ok(Self {
            shard_id,
            shards,
            active_initializing,
            rotation: Arc::new(AtomicUsize::new(rand::random::<u16>() as usize)),
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// All copies, primary and replicas, in table order
    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// The primary copy
    pub fn primary_shard(&self) -> &ShardRouting {
        // constructor guarantees exactly one
        self.shards
            .iter()
            .find(|s| s.primary)
            .unwrap_or(&self.shards[0])
    }

    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    pub fn has_active_shard(&self) -> bool {
        self.shards.iter().any(|s| s.active())
    }

    /// Copies in primary-first order; used to resolve a write location
    pub fn primary_first_it(&self) -> ShardIterator {
        let mut ordered = vec![self.primary_shard().clone()];
        ordered.extend(self.replica_shards().cloned());
        ShardIterator::new(self.shard_id.clone(), ordered)
    }

    /// Active and initializing copies rotated by `hash`
    pub fn active_initializing_shards_it(&self, hash: u32) -> ShardIterator {
        ShardIterator::new(
            self.shard_id.clone(),
            rotate(&self.active_initializing, hash as usize),
        )
    }

    /// Active and initializing copies in a load-spreading rotation
    pub fn active_initializing_shards_random_it(&self) -> ShardIterator {
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        ShardIterator::new(
            self.shard_id.clone(),
            rotate(&self.active_initializing, offset),
        )
    }

    /// Only copies hosted on `node_id`
    pub fn only_node_active_initializing_shards_it(&self, node_id: &str) -> ShardIterator {
        let shards = self
            .active_initializing
            .iter()
            .filter(|s| s.on_node(node_id))
            .cloned()
            .collect();
        ShardIterator::new(self.shard_id.clone(), shards)
    }

    /// Copies on the listed nodes first, all others after
    pub fn prefer_node_active_initializing_shards_it(
        &self,
        node_ids: &HashSet<String>,
    ) -> ShardIterator {
        let mut preferred = Vec::with_capacity(self.active_initializing.len());
        let mut rest = Vec::new();
        for shard in &self.active_initializing {
            let on_preferred = shard
                .current_node_id
                .as_ref()
                .is_some_and(|n| node_ids.contains(n));
            if on_preferred {
                preferred.push(shard.clone());
            } else {
                rest.push(shard.clone());
            }
        }
        preferred.extend(rest);
        ShardIterator::new(self.shard_id.clone(), preferred)
    }

    /// Only copies on the listed nodes
    pub fn only_nodes_active_initializing_shards_it(
        &self,
        node_ids: &HashSet<String>,
    ) -> ShardIterator {
        let shards = self
            .active_initializing
            .iter()
            .filter(|s| {
                s.current_node_id
                    .as_ref()
                    .is_some_and(|n| node_ids.contains(n))
            })
            .cloned()
            .collect();
        ShardIterator::new(self.shard_id.clone(), shards)
    }

    /// Copies whose node matches every awareness attribute value of the
    /// local node come first; the rest follow. Both groups are rotated so
    /// load still spreads within a zone.
    pub fn prefer_attributes_active_initializing_shards_it(
        &self,
        attributes: &[String],
        nodes: &DiscoveryNodes,
        hash: Option<u32>,
    ) -> ShardIterator {
        let local = match nodes.local_node() {
            Some(local) => local,
            None => {
                return match hash {
                    Some(h) => self.active_initializing_shards_it(h),
                    None => self.active_initializing_shards_random_it(),
                }
            }
        };
        let mut matching = Vec::new();
        let mut rest = Vec::new();
        for shard in &self.active_initializing {
            let node = shard.current_node_id.as_deref().and_then(|id| nodes.get(id));
            let matches = node.is_some_and(|node| {
                attributes
                    .iter()
                    .all(|attr| node.attr(attr).is_some() && node.attr(attr) == local.attr(attr))
            });
            if matches {
                matching.push(shard.clone());
            } else {
                rest.push(shard.clone());
            }
        }
        let offset = hash
            .map(|h| h as usize)
            .unwrap_or_else(|| self.rotation.fetch_add(1, Ordering::Relaxed));
        let mut ordered = rotate(&matching, offset);
        ordered.extend(rotate(&rest, offset));
        ShardIterator::new(self.shard_id.clone(), ordered)
    }
}

/// Routing of all shards of one index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRoutingTable {
    index: Index,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn builder(index: Index) -> IndexRoutingTableBuilder {
        IndexRoutingTableBuilder {
            index,
            shards: BTreeMap::new(),
        }
    }

    /// Fresh routing for a new index: every copy unassigned
    pub fn new_unassigned(metadata: &IndexMetadata, reason: &str) -> Result<Self> {
        let mut builder = Self::builder(metadata.index().clone());
        for number in 0..metadata.number_of_shards() {
            let shard_id = ShardId::new(metadata.index().clone(), number);
            let mut copies = vec![ShardRouting::unassigned(shard_id.clone(), true, reason)];
            for _ in 0..metadata.number_of_replicas() {
                copies.push(ShardRouting::unassigned(shard_id.clone(), false, reason));
            }
            builder.add_shard_table(IndexShardRoutingTable::new(shard_id, copies)?);
        }
        Ok(builder.build())
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn shard(&self, number: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&number)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexShardRoutingTable> {
        self.shards.values()
    }

    /// All copies of all shards
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flat_map(|t| t.shards().iter())
    }

    /// Does every shard have at least one active copy
    pub fn all_shards_active(&self) -> bool {
        self.shards.values().all(|t| t.has_active_shard())
    }

    /// Routing for the index after a close: copies keep their nodes but
    /// re-initialize, unassigned copies stay unassigned.
    pub fn reinitialize_for_close(&self) -> Result<Self> {
        let mut builder = Self::builder(self.index.clone());
        for table in self.shards.values() {
            let copies = table
                .shards()
                .iter()
                .map(|copy| match &copy.current_node_id {
                    Some(node) => copy.initialize(node.clone()),
                    None => copy.clone(),
                })
                .collect();
            builder.add_shard_table(IndexShardRoutingTable::new(table.shard_id().clone(), copies)?);
        }
        Ok(builder.build())
    }
}

/// Builder for one index's routing
#[derive(Debug)]
pub struct IndexRoutingTableBuilder {
    index: Index,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTableBuilder {
    pub fn add_shard_table(&mut self, table: IndexShardRoutingTable) -> &mut Self {
        self.shards.insert(table.shard_id().shard_number(), table);
        self
    }

    pub fn build(&self) -> IndexRoutingTable {
        IndexRoutingTable {
            index: self.index.clone(),
            shards: self.shards.clone(),
        }
    }
}

/// Routing of every index in the cluster, keyed by uuid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    pub fn index(&self, uuid: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(uuid)
    }

    pub fn has_index(&self, uuid: &str) -> bool {
        self.indices.contains_key(uuid)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    /// Routing of one shard group
    pub fn shard_routing_table(&self, uuid: &str, number: u32) -> Result<&IndexShardRoutingTable> {
        let index = self
            .indices
            .get(uuid)
            .ok_or_else(|| Error::IndexNotFound(uuid.to_string()))?;
        index.shard(number).ok_or_else(|| {
            Error::ShardNotFound(ShardId::new(index.index().clone(), number))
        })
    }
}

/// Builder for the cluster routing table
#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTableBuilder {
    pub fn from(table: &RoutingTable) -> Self {
        Self {
            indices: table.indices.clone(),
        }
    }

    pub fn add(&mut self, index: IndexRoutingTable) -> &mut Self {
        self.indices.insert(index.index().uuid().to_string(), index);
        self
    }

    pub fn remove(&mut self, uuid: &str) -> &mut Self {
        self.indices.remove(uuid);
        self
    }

    pub fn build(&self) -> RoutingTable {
        RoutingTable {
            indices: self.indices.clone(),
        }
    }
}
