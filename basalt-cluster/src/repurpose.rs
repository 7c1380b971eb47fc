//! Node data layout and the repurpose tool
//!
//! Each node keeps one directory per index uuid under `<data>/indices/`,
//! with one subdirectory per shard number and a `_state` subdirectory for
//! the index metadata. Deletion is atomic: the directory is renamed to a
//! `.deleting` sibling first, then removed, so a crash mid-delete never
//! leaves a half-deleted directory under its live name.
//!
//! `repurpose_node` cleans a data directory after a node's roles changed:
//! a data node keeps everything, a master-only node keeps index metadata
//! but drops shard data, a coordination-only node drops both.

use crate::error::Result;
use basalt::node::NodeRole;
use basalt::shard::ShardId;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const INDICES_DIR: &str = "indices";
const STATE_DIR: &str = "_state";
const DELETE_SUFFIX: &str = ".deleting";

/// Filesystem layout of one node's data directory
#[derive(Debug, Clone)]
pub struct NodePaths {
    data: PathBuf,
}

impl NodePaths {
    pub fn new(data: impl Into<PathBuf>) -> Self {
        Self { data: data.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn indices_dir(&self) -> PathBuf {
        self.data.join(INDICES_DIR)
    }

    pub fn index_dir(&self, index_uuid: &str) -> PathBuf {
        self.indices_dir().join(index_uuid)
    }

    pub fn index_state_dir(&self, index_uuid: &str) -> PathBuf {
        self.index_dir(index_uuid).join(STATE_DIR)
    }

    pub fn shard_dir(&self, shard_id: &ShardId) -> PathBuf {
        self.index_dir(shard_id.index_uuid())
            .join(shard_id.shard_number().to_string())
    }

    /// Index uuids present on disk
    pub fn index_uuids(&self) -> Result<Vec<String>> {
        let indices = self.indices_dir();
        if !indices.exists() {
            return Ok(Vec::new());
        }
        let mut uuids = Vec::new();
        for entry in fs::read_dir(indices)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(DELETE_SUFFIX) {
                    uuids.push(name);
                }
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    /// Shard numbers of one index present on disk
    pub fn shard_numbers(&self, index_uuid: &str) -> Result<Vec<u32>> {
        let index_dir = self.index_dir(index_uuid);
        if !index_dir.exists() {
            return Ok(Vec::new());
        }
        let mut numbers = Vec::new();
        for entry in fs::read_dir(index_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(number) = entry.file_name().to_string_lossy().parse::<u32>() {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

/// Rename-then-delete: the directory disappears from its live name
/// atomically, the recursive delete happens on the renamed sibling
fn remove_dir_atomically(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let mut deleting = dir.as_os_str().to_owned();
    deleting.push(DELETE_SUFFIX);
    let deleting = PathBuf::from(deleting);
    fs::rename(dir, &deleting)?;
    fs::remove_dir_all(&deleting)?;
    Ok(())
}

/// Delete one index's directory (shards and metadata)
pub fn delete_index_dir(paths: &NodePaths, index_uuid: &str) -> Result<()> {
    remove_dir_atomically(&paths.index_dir(index_uuid))
}

/// Delete the shard directories of one index, keeping its `_state`
pub fn delete_shard_dirs(paths: &NodePaths, index_uuid: &str) -> Result<()> {
    for number in paths.shard_numbers(index_uuid)? {
        let shard_dir = paths.index_dir(index_uuid).join(number.to_string());
        remove_dir_atomically(&shard_dir)?;
    }
    Ok(())
}

/// What the repurpose run removed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepurposeReport {
    pub deleted_shard_dirs: usize,
    pub deleted_index_dirs: usize,
}

/// Clean up a data directory after the node's roles changed
pub fn repurpose_node(paths: &NodePaths, roles: &BTreeSet<NodeRole>) -> Result<RepurposeReport> {
    let mut report = RepurposeReport::default();
    if roles.contains(&NodeRole::Data) {
        // data nodes keep shard data and metadata
        return Ok(report);
    }

    for uuid in paths.index_uuids()? {
        if roles.contains(&NodeRole::Master) {
            // master-only nodes keep index metadata but host no shards
            let shards = paths.shard_numbers(&uuid)?;
            delete_shard_dirs(paths, &uuid)?;
            report.deleted_shard_dirs += shards.len();
        } else {
            let shards = paths.shard_numbers(&uuid)?;
            delete_index_dir(paths, &uuid)?;
            report.deleted_shard_dirs += shards.len();
            report.deleted_index_dirs += 1;
        }
    }
    info!(
        "repurposed node: removed {} shard dir(s), {} index dir(s)",
        report.deleted_shard_dirs, report.deleted_index_dirs
    );
    Ok(report)
}
