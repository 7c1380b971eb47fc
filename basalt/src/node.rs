//! Cluster node identities
//!
//! `DiscoveryNode` is the wire-visible identity of a peer: id, address,
//! roles, awareness attributes and the protocol version it speaks.
//! `DiscoveryNodes` is the node arena inside a cluster state, tracking which
//! node is local and which is the elected master.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Protocol version this build speaks
pub const PROTOCOL_VERSION: u32 = 5;

/// First protocol version that replicates closed indices instead of
/// dropping their routing table entries
pub const CLOSED_INDICES_REPLICATED_VERSION: u32 = 4;

/// Role a node fulfils in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Eligible to be elected master
    Master,
    /// Hosts shard copies
    Data,
}

/// Identity of a single cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node id, stable for the lifetime of the process
    pub id: String,

    /// Human-readable node name
    pub name: String,

    /// Transport address (host:port)
    pub address: String,

    /// Awareness attributes (e.g. zone, rack) used for placement and routing
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Roles this node fulfils
    #[serde(default)]
    pub roles: BTreeSet<NodeRole>,

    /// Protocol version this node speaks
    #[serde(default)]
    pub protocol_version: u32,
}

impl DiscoveryNode {
    /// Create a node with both roles and the current protocol version
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            attributes: HashMap::new(),
            roles: [NodeRole::Master, NodeRole::Data].into_iter().collect(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Replace the role set
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Add an awareness attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Override the protocol version (mixed-version clusters)
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }

    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    /// Awareness attribute value, if set
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}

/// Node arena of a cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<String, DiscoveryNode>,
    local_node_id: Option<String>,
    master_node_id: Option<String>,
}

impl DiscoveryNodes {
    pub fn builder() -> DiscoveryNodesBuilder {
        DiscoveryNodesBuilder::default()
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn local_node_id(&self) -> Option<&str> {
        self.local_node_id.as_deref()
    }

    pub fn local_node(&self) -> Option<&DiscoveryNode> {
        self.local_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn master_eligible_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_master_eligible())
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    /// Minimum protocol version across all nodes. Gates behavior that only
    /// newer nodes understand; an empty arena reports the local build version.
    pub fn min_protocol_version(&self) -> u32 {
        self.nodes
            .values()
            .map(|n| n.protocol_version)
            .min()
            .unwrap_or(PROTOCOL_VERSION)
    }
}

/// Builder for a node arena
#[derive(Debug, Default)]
pub struct DiscoveryNodesBuilder {
    nodes: BTreeMap<String, DiscoveryNode>,
    local_node_id: Option<String>,
    master_node_id: Option<String>,
}

impl DiscoveryNodesBuilder {
    /// Start from an existing arena
    pub fn from(nodes: &DiscoveryNodes) -> Self {
        Self {
            nodes: nodes.nodes.clone(),
            local_node_id: nodes.local_node_id.clone(),
            master_node_id: nodes.master_node_id.clone(),
        }
    }

    pub fn add(&mut self, node: DiscoveryNode) -> &mut Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn remove(&mut self, node_id: &str) -> &mut Self {
        self.nodes.remove(node_id);
        self
    }

    pub fn local_node_id(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.local_node_id = Some(node_id.into());
        self
    }

    pub fn master_node_id(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.master_node_id = Some(node_id.into());
        self
    }

    pub fn build(&self) -> DiscoveryNodes {
        DiscoveryNodes {
            nodes: self.nodes.clone(),
            local_node_id: self.local_node_id.clone(),
            master_node_id: self.master_node_id.clone(),
        }
    }
}
