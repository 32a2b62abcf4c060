//! Node descriptors and the static network directory.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ubot_id::NodeNumber;

use crate::error::NetConfigError;

/// Immutable description of one UBot in the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    /// Node number, unique within the network.
    pub number: NodeNumber,

    /// Public key (opaque; signatures are verified elsewhere).
    #[serde(default)]
    pub public_key: String,

    /// Address for notification packets.
    pub udp_addr: SocketAddr,

    /// Base URL of the node's HTTP surface.
    pub http_url: String,
}

/// Directory of every known node, keyed by node number.
#[derive(Debug, Clone, Default)]
pub struct NetConfig {
    nodes: BTreeMap<NodeNumber, NodeDescriptor>,
}

impl NetConfig {
    /// Build a directory from descriptors, rejecting duplicate numbers.
    pub fn new(descriptors: Vec<NodeDescriptor>) -> Result<Self, NetConfigError> {
        if descriptors.is_empty() {
            return Err(NetConfigError::Empty);
        }

        let mut nodes = BTreeMap::new();
        for descriptor in descriptors {
            let number = descriptor.number;
            if nodes.insert(number, descriptor).is_some() {
                return Err(NetConfigError::DuplicateNode(number));
            }
        }
        Ok(Self { nodes })
    }

    /// Parse a JSON array of descriptors.
    pub fn from_json(json: &str) -> Result<Self, NetConfigError> {
        let descriptors: Vec<NodeDescriptor> = serde_json::from_str(json)?;
        Self::new(descriptors)
    }

    /// Load a JSON array of descriptors from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Look up a node by number.
    pub fn get(&self, number: NodeNumber) -> Option<&NodeDescriptor> {
        self.nodes.get(&number)
    }

    /// Returns true if the node is known.
    pub fn contains(&self, number: NodeNumber) -> bool {
        self.nodes.contains_key(&number)
    }

    /// Total number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All descriptors, ordered by node number.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// All descriptors except `except`, ordered by node number.
    pub fn others(&self, except: NodeNumber) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(move |n| n.number != except)
    }
}
