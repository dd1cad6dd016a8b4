//! Abstract operations against a MySQL Cluster management server.
//!
//! The reconciler only depends on the [`MgmClient`] trait; the TCP client in
//! [`client`] implements it against a live ndb_mgmd. A session is scoped to
//! a single reconciliation and must be released on every exit path.

pub mod client;

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from management server operations.
#[derive(Error, Debug)]
pub enum MgmError {
    #[error("I/O error talking to management server: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out talking to management server")]
    Timeout,

    #[error("unexpected reply from management server: {0}")]
    Protocol(String),

    #[error("management server rejected the request: {0}")]
    Server(String),

    #[error("could not reach management node {0}")]
    NodeUnreachable(i32),
}

/// Role of a node as reported by the management server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Management server (MGM).
    Mgm,
    /// Data node (NDB).
    Ndb,
    /// API slot, including MySQL Servers.
    Api,
}

impl FromStr for NodeRole {
    type Err = MgmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "MGM" => Ok(NodeRole::Mgm),
            "NDB" => Ok(NodeRole::Ndb),
            "API" => Ok(NodeRole::Api),
            other => Err(MgmError::Protocol(format!("unknown node type {other:?}"))),
        }
    }
}

/// Status of a single node in the cluster.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub node_id: i32,
    pub role: NodeRole,
    /// Node group of a data node; -1 when not (yet) part of one.
    pub node_group: i32,
    pub connected: bool,
}

/// Status of every node known to the management server, keyed by node id.
#[derive(Clone, Debug, Default)]
pub struct ClusterStatus {
    nodes: BTreeMap<i32, NodeStatus>,
}

impl ClusterStatus {
    pub fn insert(&mut self, node: NodeStatus) {
        self.nodes.insert(node.node_id, node);
    }

    pub fn get(&self, node_id: i32) -> Option<&NodeStatus> {
        self.nodes.get(&node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeStatus> {
        self.nodes.values()
    }

    /// True when every management and data node is connected. API slots are
    /// ignored: free slots and scaled-down MySQL Servers are legitimately
    /// disconnected.
    pub fn is_healthy(&self) -> bool {
        self.nodes
            .values()
            .filter(|n| matches!(n.role, NodeRole::Mgm | NodeRole::Ndb))
            .all(|n| n.connected)
    }

    /// Data node ids grouped by node group: the outer list is ordered by
    /// node group id and every inner list is ordered by node id. Returns
    /// None when any data node has not been assigned to a group yet.
    pub fn nodes_grouped_by_nodegroup(&self) -> Option<Vec<Vec<i32>>> {
        let mut groups: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
        for node in self.nodes.values().filter(|n| n.role == NodeRole::Ndb) {
            if node.node_group < 0 {
                return None;
            }
            groups.entry(node.node_group).or_default().push(node.node_id);
        }

        // BTreeMap iteration orders the groups; the ids within a group are
        // inserted in ascending node-id order already.
        Some(groups.into_values().collect())
    }
}

/// Operations offered by a connected management server session.
#[async_trait]
pub trait MgmClient: Send {
    /// Status of all nodes in the cluster.
    async fn get_status(&mut self) -> Result<ClusterStatus, MgmError>;

    /// The config generation a node is running with. Without a node id the
    /// management server answers for itself.
    async fn get_config_version(&mut self, node_id: Option<i32>) -> Result<u32, MgmError>;

    /// Request a controlled shutdown of the given nodes. Returns once the
    /// request is accepted, not once the nodes are down.
    async fn stop_nodes(&mut self, node_ids: &[i32]) -> Result<(), MgmError>;

    /// End the session. The connection is unusable afterwards.
    async fn end_session(&mut self) -> Result<(), MgmError>;
}

/// Produces management server sessions. The reconciler asks for a specific
/// node id; implementations reconnect through load balancers until the
/// desired node answers.
#[async_trait]
pub trait MgmConnector: Send + Sync {
    async fn connect(
        &self,
        connectstring: &str,
        desired_node_id: i32,
    ) -> Result<Box<dyn MgmClient>, MgmError>;
}
