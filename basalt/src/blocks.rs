//! Cluster blocks
//!
//! A block prevents operations of a given level (read, write, metadata) on
//! the whole cluster or on a single index. Blocks are only added and removed
//! through cluster-state tasks on the master; every node observes them after
//! applying the published state.
//!
//! Block id 4 is reserved for CLOSED: its presence on an index means the
//! index is closed and writes must be rejected.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Operation level a block applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBlockLevel {
    Read,
    Write,
    MetadataRead,
    MetadataWrite,
}

/// Block id reserved for closed indices
pub const INDEX_CLOSED_BLOCK_ID: u32 = 4;

/// A single block descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    /// Well-known block id
    pub id: u32,

    /// Uuid distinguishing transient per-operation blocks with the same id
    #[serde(default)]
    pub uuid: Option<String>,

    /// Human-readable reason, surfaced in rejection errors
    pub reason: String,

    /// Levels this block applies to
    pub levels: BTreeSet<ClusterBlockLevel>,

    /// Whether a blocked request may be retried once the block lifts
    #[serde(default)]
    pub retryable: bool,
}

impl ClusterBlock {
    /// Create a block over the given levels
    pub fn new(
        id: u32,
        uuid: Option<String>,
        reason: impl Into<String>,
        levels: impl IntoIterator<Item = ClusterBlockLevel>,
    ) -> Self {
        Self {
            id,
            uuid,
            reason: reason.into(),
            levels: levels.into_iter().collect(),
            retryable: false,
        }
    }

    /// Does this block apply to `level`
    pub fn contains(&self, level: ClusterBlockLevel) -> bool {
        self.levels.contains(&level)
    }
}

/// The canonical block carried by every closed index
pub fn index_closed_block() -> ClusterBlock {
    ClusterBlock::new(
        INDEX_CLOSED_BLOCK_ID,
        None,
        "index closed",
        [ClusterBlockLevel::Read, ClusterBlockLevel::Write],
    )
}

/// Mint the transient write block added while an index is being closed.
/// Carries a fresh uuid so the commit step can verify it survived unchanged.
pub fn new_close_block(uuid: impl Into<String>) -> ClusterBlock {
    ClusterBlock::new(
        INDEX_CLOSED_BLOCK_ID,
        Some(uuid.into()),
        "preparing to close",
        [ClusterBlockLevel::Write],
    )
}

/// Immutable set of global and per-index blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: Vec<ClusterBlock>,
    indices: BTreeMap<String, Vec<ClusterBlock>>,
}

impl ClusterBlocks {
    /// Blocks applying to the whole cluster
    pub fn global(&self) -> &[ClusterBlock] {
        &self.global
    }

    /// Blocks on the index with the given uuid
    pub fn index_blocks(&self, index_uuid: &str) -> &[ClusterBlock] {
        self.indices.get(index_uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Is there any block with `id` on this index
    pub fn has_index_block(&self, index_uuid: &str, id: u32) -> bool {
        self.index_blocks(index_uuid).iter().any(|b| b.id == id)
    }

    /// First block with `id` on this index, if any
    pub fn get_index_block(&self, index_uuid: &str, id: u32) -> Option<&ClusterBlock> {
        self.index_blocks(index_uuid).iter().find(|b| b.id == id)
    }

    /// Is an operation at `level` blocked for this index (global or per-index)
    pub fn index_blocked(&self, level: ClusterBlockLevel, index_uuid: &str) -> bool {
        self.global.iter().any(|b| b.contains(level))
            || self.index_blocks(index_uuid).iter().any(|b| b.contains(level))
    }

    /// Reject an operation at `level` if any matching block exists
    pub fn check_index(&self, level: ClusterBlockLevel, index_uuid: &str) -> Result<()> {
        let blocked = self
            .global
            .iter()
            .chain(self.index_blocks(index_uuid))
            .find(|b| b.contains(level));
        match blocked {
            Some(block) => Err(Error::Blocked {
                level,
                reason: block.reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Start a builder from this set
    pub fn builder(&self) -> ClusterBlocksBuilder {
        ClusterBlocksBuilder {
            global: self.global.clone(),
            indices: self.indices.clone(),
        }
    }
}

/// Builder producing a new immutable block set
#[derive(Debug, Default)]
pub struct ClusterBlocksBuilder {
    global: Vec<ClusterBlock>,
    indices: BTreeMap<String, Vec<ClusterBlock>>,
}

impl ClusterBlocksBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global block; duplicate `(id, uuid)` pairs are ignored
    pub fn add_global_block(&mut self, block: ClusterBlock) -> &mut Self {
        if !self.global.iter().any(|b| b.id == block.id && b.uuid == block.uuid) {
            self.global.push(block);
        }
        self
    }

    /// Add an index block; duplicate `(id, uuid)` pairs are ignored
    pub fn add_index_block(&mut self, index_uuid: &str, block: ClusterBlock) -> &mut Self {
        let blocks = self.indices.entry(index_uuid.to_string()).or_default();
        if !blocks.iter().any(|b| b.id == block.id && b.uuid == block.uuid) {
            blocks.push(block);
        }
        self
    }

    /// Remove every block with `id` from the index
    pub fn remove_index_block_with_id(&mut self, index_uuid: &str, id: u32) -> &mut Self {
        if let Some(blocks) = self.indices.get_mut(index_uuid) {
            blocks.retain(|b| b.id != id);
            if blocks.is_empty() {
                self.indices.remove(index_uuid);
            }
        }
        self
    }

    /// Drop all blocks for an index (index deletion)
    pub fn remove_index_blocks(&mut self, index_uuid: &str) -> &mut Self {
        self.indices.remove(index_uuid);
        self
    }

    pub fn build(&self) -> ClusterBlocks {
        ClusterBlocks {
            global: self.global.clone(),
            indices: self.indices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_block_shape() {
        let block = index_closed_block();
        assert_eq!(block.id, INDEX_CLOSED_BLOCK_ID);
        assert!(block.uuid.is_none());
        assert!(block.contains(ClusterBlockLevel::Write));
        assert!(block.contains(ClusterBlockLevel::Read));
        assert!(!block.contains(ClusterBlockLevel::MetadataRead));
    }

    #[test]
    fn test_close_preparation_block_is_write_only() {
        let block = new_close_block("b-uuid");
        assert_eq!(block.id, INDEX_CLOSED_BLOCK_ID);
        assert_eq!(block.uuid.as_deref(), Some("b-uuid"));
        assert!(block.contains(ClusterBlockLevel::Write));
        assert!(!block.contains(ClusterBlockLevel::Read));
    }

    #[test]
    fn test_check_index() {
        let mut builder = ClusterBlocksBuilder::new();
        builder.add_index_block("u-1", index_closed_block());
        let blocks = builder.build();

        let err = blocks
            .check_index(ClusterBlockLevel::Write, "u-1")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Blocked {
                level: ClusterBlockLevel::Write,
                ..
            }
        ));

        assert!(blocks.check_index(ClusterBlockLevel::Write, "u-2").is_ok());
        assert!(blocks
            .check_index(ClusterBlockLevel::MetadataRead, "u-1")
            .is_ok());
    }

    #[test]
    fn test_global_block_applies_to_all_indices() {
        let mut builder = ClusterBlocksBuilder::new();
        builder.add_global_block(ClusterBlock::new(
            1,
            None,
            "state not recovered",
            [ClusterBlockLevel::Write, ClusterBlockLevel::MetadataWrite],
        ));
        let blocks = builder.build();
        assert!(blocks.index_blocked(ClusterBlockLevel::Write, "anything"));
        assert!(!blocks.index_blocked(ClusterBlockLevel::Read, "anything"));
    }

    #[test]
    fn test_duplicate_blocks_ignored() {
        let mut builder = ClusterBlocksBuilder::new();
        builder.add_index_block("u-1", new_close_block("b-1"));
        builder.add_index_block("u-1", new_close_block("b-1"));
        builder.add_index_block("u-1", new_close_block("b-2"));
        let blocks = builder.build();
        assert_eq!(blocks.index_blocks("u-1").len(), 2);
    }

    #[test]
    fn test_remove_by_id() {
        let mut builder = ClusterBlocksBuilder::new();
        builder.add_index_block("u-1", new_close_block("b-1"));
        let blocks = builder.build();

        let mut builder = blocks.builder();
        builder.remove_index_block_with_id("u-1", INDEX_CLOSED_BLOCK_ID);
        let blocks = builder.build();
        assert!(!blocks.has_index_block("u-1", INDEX_CLOSED_BLOCK_ID));
        assert!(blocks.index_blocks("u-1").is_empty());
    }
}
