//! Operation routing
//!
//! Maps `(index, id, routing, preference)` to the shard that owns a
//! document and to the ordered list of copies a read should try. The shard
//! number is computed against the original (`routing_num_shards`) shard
//! count and divided by the routing factor, so placement survives shrinks.

use crate::error::{Error, Result};
use crate::metadata::IndexMetadata;
use crate::routing::hash::{floor_mod, hash_routing};
use crate::routing::{IndexShardRoutingTable, ShardIterator};
use crate::shard::ShardId;
use crate::state::ClusterState;
use std::collections::HashSet;

const PREFERENCE_SHARDS: &str = "_shards:";
const PREFERENCE_PREFER_NODES: &str = "_prefer_nodes:";
const PREFERENCE_ONLY_NODES: &str = "_only_nodes:";
const PREFERENCE_LOCAL: &str = "_local";
const PREFERENCE_ONLY_LOCAL: &str = "_only_local";

/// Shard number a document routes to.
///
/// The effective routing key is the explicit routing value if given,
/// otherwise the id. Routing-partitioned indexes fold `hash(id) mod
/// partition_size` into the sum so related ids land near each other.
pub fn generate_shard_number(metadata: &IndexMetadata, id: &str, routing: Option<&str>) -> u32 {
    let effective_routing = routing.unwrap_or(id);
    let partition_offset = if metadata.is_routing_partitioned() {
        floor_mod(hash_routing(id), metadata.routing_partition_size() as i32)
    } else {
        0
    };
    let hash = hash_routing(effective_routing).wrapping_add(partition_offset);
    let scaled = floor_mod(hash, metadata.routing_num_shards() as i32) as u32;
    scaled / metadata.routing_factor()
}

/// Preference-aware shard selection over a cluster-state snapshot
#[derive(Debug, Clone, Default)]
pub struct OperationRouting {
    awareness_attributes: Vec<String>,
}

impl OperationRouting {
    pub fn new(awareness_attributes: Vec<String>) -> Self {
        Self {
            awareness_attributes,
        }
    }

    /// The routing table entry of the shard owning `id`
    pub fn shards_for<'a>(
        &self,
        state: &'a ClusterState,
        index_uuid: &str,
        id: &str,
        routing: Option<&str>,
    ) -> Result<&'a IndexShardRoutingTable> {
        let metadata = state
            .metadata()
            .index(index_uuid)
            .ok_or_else(|| Error::IndexNotFound(index_uuid.to_string()))?;
        let number = generate_shard_number(metadata, id, routing);
        state.routing_table().shard_routing_table(index_uuid, number)
    }

    /// The shard id owning `id`
    pub fn shard_id(
        &self,
        state: &ClusterState,
        index_uuid: &str,
        id: &str,
        routing: Option<&str>,
    ) -> Result<ShardId> {
        Ok(self.shards_for(state, index_uuid, id, routing)?.shard_id().clone())
    }

    /// Copies of the owning shard in primary-first order; used by the write
    /// path to resolve the primary's node.
    pub fn index_shards(
        &self,
        state: &ClusterState,
        index_uuid: &str,
        id: &str,
        routing: Option<&str>,
    ) -> Result<ShardIterator> {
        Ok(self.shards_for(state, index_uuid, id, routing)?.primary_first_it())
    }

    /// Copies of the owning shard in the order a read should try them,
    /// honoring the client preference.
    pub fn get_shards(
        &self,
        state: &ClusterState,
        index_uuid: &str,
        id: &str,
        routing: Option<&str>,
        preference: Option<&str>,
    ) -> Result<ShardIterator> {
        let table = self.shards_for(state, index_uuid, id, routing)?;
        self.preference_iterator(state, table, preference)
    }

    fn preference_iterator(
        &self,
        state: &ClusterState,
        table: &IndexShardRoutingTable,
        preference: Option<&str>,
    ) -> Result<ShardIterator> {
        let preference = match preference {
            None | Some("") => return Ok(self.default_iterator(state, table, None)),
            Some(p) => p,
        };

        if let Some(rest) = preference.strip_prefix(PREFERENCE_SHARDS) {
            let (csv, remainder) = match rest.split_once('|') {
                Some((csv, remainder)) => (csv, Some(remainder)),
                None => (rest, None),
            };
            let mut wanted = HashSet::new();
            for part in csv.split(',') {
                let number: u32 = part.trim().parse().map_err(|_| {
                    Error::IllegalArgument(format!("invalid shard list in preference: {csv}"))
                })?;
                wanted.insert(number);
            }
            if !wanted.contains(&table.shard_id().shard_number()) {
                return Ok(ShardIterator::empty(table.shard_id().clone()));
            }
            // an empty remainder means no further preference: random routing
            return match remainder {
                None | Some("") => Ok(table.active_initializing_shards_random_it()),
                Some(rest) => self.preference_iterator(state, table, Some(rest)),
            };
        }

        if let Some(csv) = preference.strip_prefix(PREFERENCE_PREFER_NODES) {
            return Ok(table.prefer_node_active_initializing_shards_it(&parse_node_set(csv)));
        }
        if let Some(csv) = preference.strip_prefix(PREFERENCE_ONLY_NODES) {
            return Ok(table.only_nodes_active_initializing_shards_it(&parse_node_set(csv)));
        }
        if preference == PREFERENCE_ONLY_LOCAL {
            return Ok(match state.nodes().local_node_id() {
                Some(local) => table.only_node_active_initializing_shards_it(local),
                None => ShardIterator::empty(table.shard_id().clone()),
            });
        }
        if preference == PREFERENCE_LOCAL {
            return Ok(match state.nodes().local_node_id() {
                Some(local) => {
                    let nodes = [local.to_string()].into_iter().collect();
                    table.prefer_node_active_initializing_shards_it(&nodes)
                }
                None => self.default_iterator(state, table, None),
            });
        }
        if preference.starts_with('_') {
            return Err(Error::IllegalArgument(format!(
                "no preference type for [{preference}]"
            )));
        }

        // Opaque preference key: pick deterministically, but let distinct
        // shards under the same key land on distinct replicas.
        let routing_hash = 31i32
            .wrapping_mul(hash_routing(preference))
            .wrapping_add(table.shard_id().stable_hash());
        Ok(self.default_iterator(state, table, Some(routing_hash as u32)))
    }

    fn default_iterator(
        &self,
        state: &ClusterState,
        table: &IndexShardRoutingTable,
        hash: Option<u32>,
    ) -> ShardIterator {
        if self.awareness_attributes.is_empty() {
            match hash {
                Some(h) => table.active_initializing_shards_it(h),
                None => table.active_initializing_shards_random_it(),
            }
        } else {
            table.prefer_attributes_active_initializing_shards_it(
                &self.awareness_attributes,
                state.nodes(),
                hash,
            )
        }
    }
}

fn parse_node_set(csv: &str) -> HashSet<String> {
    csv.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{IndexMetadata, Metadata};
    use crate::node::{DiscoveryNode, DiscoveryNodes};
    use crate::routing::{IndexRoutingTable, IndexShardRoutingTable, RoutingTable, ShardRouting};
    use crate::shard::Index;
    use crate::state::ClusterState;

    fn metadata(shards: u32) -> IndexMetadata {
        IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(shards)
            .build()
            .unwrap()
    }

    /// One index with `shards` shards, each with copies on n1 (primary) and n2
    fn state_with_replicas(shards: u32) -> ClusterState {
        let meta = metadata(shards);
        let mut index_builder = IndexRoutingTable::builder(meta.index().clone());
        for number in 0..shards {
            let shard_id = ShardId::new(meta.index().clone(), number);
            let primary = ShardRouting::unassigned(shard_id.clone(), true, "new")
                .initialize("n1")
                .start();
            let replica = ShardRouting::unassigned(shard_id.clone(), false, "new")
                .initialize("n2")
                .start();
            index_builder.add_shard_table(
                IndexShardRoutingTable::new(shard_id, vec![primary, replica]).unwrap(),
            );
        }
        let mut routing = RoutingTable::builder();
        routing.add(index_builder.build());

        let mut metadata_builder = Metadata::builder();
        metadata_builder.put(meta).unwrap();

        let mut nodes = DiscoveryNodes::builder();
        nodes
            .add(DiscoveryNode::new("n1", "node-1", "a:1"))
            .add(DiscoveryNode::new("n2", "node-2", "b:1"))
            .local_node_id("n2");

        ClusterState::builder()
            .nodes(nodes.build())
            .metadata(metadata_builder.build())
            .routing_table(routing.build())
            .build()
    }

    #[test]
    fn test_simple_route() {
        // floor_mod(murmur3("abc"), 12) == 3
        let meta = metadata(12);
        assert_eq!(generate_shard_number(&meta, "abc", None), 3);
    }

    #[test]
    fn test_explicit_routing_overrides_id() {
        let meta = metadata(12);
        assert_eq!(
            generate_shard_number(&meta, "whatever", Some("abc")),
            generate_shard_number(&meta, "abc", None)
        );
    }

    #[test]
    fn test_routing_determinism_across_states() {
        // the shard number only depends on metadata, id and routing
        let meta = metadata(8);
        let n = generate_shard_number(&meta, "user-7", None);
        for _ in 0..10 {
            assert_eq!(generate_shard_number(&meta, "user-7", None), n);
        }
        assert_eq!(n, 5); // floor_mod(murmur3("user-7"), 8)
    }

    #[test]
    fn test_shrink_preserves_placement() {
        let before = IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(12)
            .build()
            .unwrap();
        let after = IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(4)
            .routing_num_shards(12)
            .build()
            .unwrap();
        for id in ["a", "b", "c", "d", "abc", "user-7"] {
            let wide = generate_shard_number(&before, id, None);
            let narrow = generate_shard_number(&after, id, None);
            assert_eq!(narrow, wide / 3, "id {id}");
        }
    }

    #[test]
    fn test_partitioned_routing_offsets_by_id() {
        let meta = IndexMetadata::builder(Index::new("doc.t", "u-1"))
            .number_of_shards(12)
            .routing_partition_size(4)
            .build()
            .unwrap();
        // same routing key, different ids: shards stay within the partition
        // window instead of collapsing onto one shard
        let numbers: HashSet<u32> = ["a", "b", "c", "d", "x"]
            .iter()
            .map(|id| generate_shard_number(&meta, id, Some("tenant-1")))
            .collect();
        assert!(numbers.len() > 1);
        assert!(numbers.len() <= 4);
    }

    #[test]
    fn test_get_shards_unknown_index() {
        let state = state_with_replicas(2);
        let routing = OperationRouting::default();
        assert!(matches!(
            routing.get_shards(&state, "missing", "abc", None, None),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_only_local() {
        let state = state_with_replicas(1);
        let routing = OperationRouting::default();

        // local node is n2, which hosts the replica
        let copies: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("_only_local"))
            .unwrap()
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].on_node("n2"));
    }

    #[test]
    fn test_local_prefers_local_copy_first() {
        let state = state_with_replicas(1);
        let routing = OperationRouting::default();
        let copies: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("_local"))
            .unwrap()
            .collect();
        assert_eq!(copies.len(), 2);
        assert!(copies[0].on_node("n2"));
    }

    #[test]
    fn test_shards_preference_filters() {
        let state = state_with_replicas(12);
        let routing = OperationRouting::default();

        // "abc" routes to shard 3
        let it = routing
            .get_shards(&state, "u-1", "abc", None, Some("_shards:3"))
            .unwrap();
        assert!(!it.is_empty());

        let it = routing
            .get_shards(&state, "u-1", "abc", None, Some("_shards:0,1,2"))
            .unwrap();
        assert!(it.is_empty());

        // shard filter plus a nested preference
        let copies: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("_shards:3|_only_local"))
            .unwrap()
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].on_node("n2"));
    }

    #[test]
    fn test_shards_preference_empty_remainder_is_random() {
        let state = state_with_replicas(12);
        let routing = OperationRouting::default();
        let it = routing
            .get_shards(&state, "u-1", "abc", None, Some("_shards:3|"))
            .unwrap();
        assert_eq!(it.size(), 2);
    }

    #[test]
    fn test_prefer_and_only_nodes() {
        let state = state_with_replicas(1);
        let routing = OperationRouting::default();

        let copies: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("_prefer_nodes:n2,n9"))
            .unwrap()
            .collect();
        assert_eq!(copies.len(), 2);
        assert!(copies[0].on_node("n2"));

        let copies: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("_only_nodes:n1"))
            .unwrap()
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].on_node("n1"));
    }

    #[test]
    fn test_unknown_reserved_preference_rejected() {
        let state = state_with_replicas(1);
        let routing = OperationRouting::default();
        assert!(matches!(
            routing.get_shards(&state, "u-1", "abc", None, Some("_replica_first")),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_opaque_preference_is_deterministic() {
        let state = state_with_replicas(4);
        let routing = OperationRouting::default();
        let first: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("session-42"))
            .unwrap()
            .map(|s| s.current_node_id)
            .collect();
        let second: Vec<_> = routing
            .get_shards(&state, "u-1", "abc", None, Some("session-42"))
            .unwrap()
            .map(|s| s.current_node_id)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_opaque_preference_spreads_across_shards() {
        // distinct shards under one preference key should not all pick the
        // same replica position
        let state = state_with_replicas(8);
        let routing = OperationRouting::default();
        let mut first_nodes = HashSet::new();
        for id in ["a", "b", "c", "d", "x", "user-7"] {
            let copy = routing
                .get_shards(&state, "u-1", id, None, Some("session-42"))
                .unwrap()
                .next()
                .unwrap();
            first_nodes.insert(copy.current_node_id.clone());
        }
        assert!(first_nodes.len() >= 2);
    }
}
