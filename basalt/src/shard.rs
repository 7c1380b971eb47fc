//! Index and shard identity types
//!
//! An index is identified by a `(name, uuid)` pair. The uuid is the stable
//! identifier; names are human labels and may be reused after deletion, so
//! all routing, storage and block lookups go through the uuid. A `ShardId`
//! pins one horizontal partition of an index.

use crate::routing::hash::hash_routing;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable identity of an index: reusable human name plus the immutable uuid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index {
    name: String,
    uuid: String,
}

impl Index {
    /// Create an index identity
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Human-facing index name (diagnostics only, may be reused)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable uuid used for all lookups
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.uuid)
    }
}

/// Identity of a single shard of an index.
///
/// Equality and hashing use `(uuid, shard_number)` only; the name is carried
/// for diagnostics. Ordering is by shard number, then uuid, then name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardId {
    index: Index,
    shard: u32,
}

impl ShardId {
    /// Create a shard id for `shard` of `index`
    pub fn new(index: Index, shard: u32) -> Self {
        Self { index, shard }
    }

    /// The owning index identity
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Shard number within the index, in `[0, num_shards)`
    pub fn shard_number(&self) -> u32 {
        self.shard
    }

    /// Index name shortcut
    pub fn index_name(&self) -> &str {
        self.index.name()
    }

    /// Index uuid shortcut
    pub fn index_uuid(&self) -> &str {
        self.index.uuid()
    }

    /// Deterministic 32-bit value used to spread preference-keyed reads
    /// across replicas. Stable across processes and cluster states.
    pub fn stable_hash(&self) -> i32 {
        hash_routing(self.index.uuid())
            .wrapping_mul(31)
            .wrapping_add(self.shard as i32)
    }
}

impl PartialEq for ShardId {
    fn eq(&self, other: &Self) -> bool {
        self.shard == other.shard && self.index.uuid() == other.index.uuid()
    }
}

impl Eq for ShardId {}

impl Hash for ShardId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.uuid().hash(state);
        self.shard.hash(state);
    }
}

impl PartialOrd for ShardId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shard
            .cmp(&other.shard)
            .then_with(|| self.index.uuid().cmp(other.index.uuid()))
            .then_with(|| self.index.name().cmp(other.index.name()))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.index, self.shard)
    }
}
