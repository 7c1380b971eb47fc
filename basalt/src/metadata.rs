//! Per-index metadata and the metadata arena
//!
//! `IndexMetadata` carries everything routing needs to stay deterministic
//! across shrink operations: the current shard count, the original
//! (`routing_num_shards`) count, and the partition size for
//! routing-partitioned indexes. The arena maps uuid → metadata and keeps a
//! name → uuid view; uuids are unique forever, names may be reused.

use crate::error::{Error, Result};
use crate::shard::Index;
use crate::table::{PartitionName, RelationName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Open,
    Close,
}

/// Metadata of a single index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    index: Index,
    state: IndexState,
    settings_version: u64,
    number_of_shards: u32,
    number_of_replicas: u32,
    routing_num_shards: u32,
    routing_partition_size: u32,
    verified_before_close: bool,
}

impl IndexMetadata {
    pub fn builder(index: Index) -> IndexMetadataBuilder {
        IndexMetadataBuilder {
            index,
            state: IndexState::Open,
            settings_version: 1,
            number_of_shards: 1,
            number_of_replicas: 0,
            routing_num_shards: None,
            routing_partition_size: 1,
            verified_before_close: false,
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn uuid(&self) -> &str {
        self.index.uuid()
    }

    pub fn name(&self) -> &str {
        self.index.name()
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn settings_version(&self) -> u64 {
        self.settings_version
    }

    pub fn number_of_shards(&self) -> u32 {
        self.number_of_shards
    }

    pub fn number_of_replicas(&self) -> u32 {
        self.number_of_replicas
    }

    /// Shard count before any shrink; document placement hashes against
    /// this so placement survives shrinking
    pub fn routing_num_shards(&self) -> u32 {
        self.routing_num_shards
    }

    pub fn routing_factor(&self) -> u32 {
        self.routing_num_shards / self.number_of_shards
    }

    pub fn routing_partition_size(&self) -> u32 {
        self.routing_partition_size
    }

    /// Related ids co-locate when the partition size is above one
    pub fn is_routing_partitioned(&self) -> bool {
        self.routing_partition_size > 1
    }

    pub fn verified_before_close(&self) -> bool {
        self.verified_before_close
    }

    /// Rebuild with changed fields
    pub fn to_builder(&self) -> IndexMetadataBuilder {
        IndexMetadataBuilder {
            index: self.index.clone(),
            state: self.state,
            settings_version: self.settings_version,
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
            routing_num_shards: Some(self.routing_num_shards),
            routing_partition_size: self.routing_partition_size,
            verified_before_close: self.verified_before_close,
        }
    }
}

/// Builder for index metadata
#[derive(Debug)]
pub struct IndexMetadataBuilder {
    index: Index,
    state: IndexState,
    settings_version: u64,
    number_of_shards: u32,
    number_of_replicas: u32,
    routing_num_shards: Option<u32>,
    routing_partition_size: u32,
    verified_before_close: bool,
}

impl IndexMetadataBuilder {
    pub fn state(mut self, state: IndexState) -> Self {
        self.state = state;
        self
    }

    pub fn settings_version(mut self, version: u64) -> Self {
        self.settings_version = version;
        self
    }

    pub fn number_of_shards(mut self, shards: u32) -> Self {
        self.number_of_shards = shards;
        self
    }

    pub fn number_of_replicas(mut self, replicas: u32) -> Self {
        self.number_of_replicas = replicas;
        self
    }

    pub fn routing_num_shards(mut self, shards: u32) -> Self {
        self.routing_num_shards = Some(shards);
        self
    }

    pub fn routing_partition_size(mut self, size: u32) -> Self {
        self.routing_partition_size = size;
        self
    }

    pub fn verified_before_close(mut self, verified: bool) -> Self {
        self.verified_before_close = verified;
        self
    }

    pub fn build(self) -> Result<IndexMetadata> {
        if self.number_of_shards == 0 {
            return Err(Error::IllegalArgument(
                "number_of_shards must be at least 1".into(),
            ));
        }
        let routing_num_shards = self.routing_num_shards.unwrap_or(self.number_of_shards);
        if routing_num_shards % self.number_of_shards != 0 {
            return Err(Error::IllegalArgument(format!(
                "routing_num_shards {} must be a multiple of number_of_shards {}",
                routing_num_shards, self.number_of_shards
            )));
        }
        if self.routing_partition_size == 0 {
            return Err(Error::IllegalArgument(
                "routing_partition_size must be at least 1".into(),
            ));
        }
        Ok(IndexMetadata {
            index: self.index,
            state: self.state,
            settings_version: self.settings_version,
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
            routing_num_shards,
            routing_partition_size: self.routing_partition_size,
            verified_before_close: self.verified_before_close,
        })
    }
}

/// Arena of index metadata inside a cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    indices: BTreeMap<String, IndexMetadata>,
    by_name: BTreeMap<String, String>,
}

impl Metadata {
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::default()
    }

    pub fn index(&self, uuid: &str) -> Option<&IndexMetadata> {
        self.indices.get(uuid)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexMetadata> {
        self.by_name.get(name).and_then(|uuid| self.indices.get(uuid))
    }

    pub fn has_index(&self, uuid: &str) -> bool {
        self.indices.contains_key(uuid)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// All indices belonging to a table: the single backing index, or every
    /// partition. `partition_values` narrows a partitioned table to one
    /// partition.
    pub fn indices_of_table(
        &self,
        relation: &RelationName,
        partition_values: Option<&[Option<String>]>,
    ) -> Vec<&IndexMetadata> {
        match partition_values {
            Some(values) => {
                let name = PartitionName::new(relation.clone(), values.to_vec()).index_name();
                self.index_by_name(&name).into_iter().collect()
            }
            None => self
                .indices
                .values()
                .filter(|m| {
                    m.name() == relation.index_name()
                        || PartitionName::is_partition_of(m.name(), relation)
                })
                .collect(),
        }
    }
}

/// Builder for the metadata arena
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    indices: BTreeMap<String, IndexMetadata>,
    by_name: BTreeMap<String, String>,
}

impl MetadataBuilder {
    pub fn from(metadata: &Metadata) -> Self {
        Self {
            indices: metadata.indices.clone(),
            by_name: metadata.by_name.clone(),
        }
    }

    /// Insert or replace metadata. Replacing a name with a different uuid is
    /// legal (deleted and re-created index); replacing a uuid's name is not.
    pub fn put(&mut self, metadata: IndexMetadata) -> Result<&mut Self> {
        if let Some(existing) = self.indices.get(metadata.uuid()) {
            if existing.name() != metadata.name() {
                return Err(Error::IllegalArgument(format!(
                    "index uuid {} is already bound to name {}",
                    metadata.uuid(),
                    existing.name()
                )));
            }
        }
        self.by_name
            .insert(metadata.name().to_string(), metadata.uuid().to_string());
        self.indices.insert(metadata.uuid().to_string(), metadata);
        Ok(self)
    }

    pub fn remove(&mut self, uuid: &str) -> &mut Self {
        if let Some(removed) = self.indices.remove(uuid) {
            if self.by_name.get(removed.name()).map(String::as_str) == Some(uuid) {
                self.by_name.remove(removed.name());
            }
        }
        self
    }

    pub fn build(&self) -> Metadata {
        Metadata {
            indices: self.indices.clone(),
            by_name: self.by_name.clone(),
        }
    }
}
