//! Cluster topology contract.
//!
//! The worker never talks HTTP itself: endpoint discovery and topology reads
//! go through a [`TopologyProvider`] the application supplies (typically a
//! thin wrapper over its HTTP request executor). The worker holds the
//! provider as a shared read-only handle; it never tears it down, and the
//! provider must not own the worker back.

use async_trait::async_trait;

use crate::error::Result;

/// One member of the database cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    /// Short cluster tag, e.g. `"A"`.
    pub cluster_tag: String,
    /// Base URL the node serves from.
    pub url: String,
}

/// Answer to a TCP info request: where to open the subscription connection.
#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
    /// URL to dial; its scheme selects plain TCP or TLS.
    pub url: String,
    /// Server certificate (PEM) for callers that build their TLS
    /// configuration per node.
    pub certificate: Option<String>,
    /// The node that actually answered, when the executor knows it.
    pub requested_node: Option<TopologyNode>,
}

/// Read-only view of the cluster, supplied by the application.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Resolve the TCP endpoint for a subscription connection.
    ///
    /// With `node_tag` set the request is pinned to that node (no failover,
    /// no retry); with `None` the executor picks its preferred node.
    async fn tcp_info(&self, node_tag: Option<&str>) -> Result<TcpConnectionInfo>;

    /// The currently known cluster members.
    async fn topology_nodes(&self) -> Result<Vec<TopologyNode>>;

    /// Credentials to embed in the connection header, if any.
    fn authorize_info(&self) -> Option<serde_json::Value> {
        None
    }
}
