//! Replication-target update operations.
//!
//! A replication task is updated through one of two admin endpoints
//! depending on the sink variant. The variants are an explicit tagged enum
//! with one constructor each; [`ReplicationTarget::update_operation`]
//! dispatches to the matching wire command, so no caller ever inspects the
//! variant itself.

use serde::Serialize;
use serde_json::Value;

/// Replication to another cluster the current database pushes to directly.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalReplication {
    /// Task name, unique per database.
    pub name: String,
    /// Target database name.
    pub database: String,
    /// Named connection string holding the target cluster URLs.
    pub connection_string_name: String,
    /// Existing task id when updating; 0 creates a new task.
    pub task_id: i64,
    pub disabled: bool,
    /// Artificial replication lag, as a wire time-span string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_replication_for: Option<String>,
    /// Pin the task to one node instead of letting the cluster balance it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentor_node: Option<String>,
}

/// Replication pulled from a hub, with this database acting as the sink.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PullReplicationAsSink {
    /// Target database name.
    pub database: String,
    /// Named connection string holding the hub cluster URLs.
    pub connection_string_name: String,
    /// Hub definition name on the remote cluster.
    pub hub_name: String,
    /// Existing task id when updating; 0 creates a new task.
    pub task_id: i64,
    pub disabled: bool,
    /// Client certificate (PKCS#12, base64) presented to the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_with_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_password: Option<String>,
}

/// A replication sink of either variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationTarget {
    External(ExternalReplication),
    PullAsSink(PullReplicationAsSink),
}

/// The admin request that updates one replication target.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationUpdateCommand {
    /// Database-relative endpoint, e.g. `admin/tasks/external-replication`.
    pub endpoint: &'static str,
    /// Request body with PascalCase keys.
    pub body: Value,
}

impl ReplicationTarget {
    /// Wrap an external replication definition.
    pub fn external(replication: ExternalReplication) -> Self {
        Self::External(replication)
    }

    /// Wrap a pull-replication sink definition.
    pub fn pull_as_sink(sink: PullReplicationAsSink) -> Self {
        Self::PullAsSink(sink)
    }

    /// Build the update command for this target's variant.
    pub fn update_operation(&self) -> ReplicationUpdateCommand {
        match self {
            Self::External(replication) => ReplicationUpdateCommand {
                endpoint: "admin/tasks/external-replication",
                body: serde_json::json!({ "Watcher": replication }),
            },
            Self::PullAsSink(sink) => ReplicationUpdateCommand {
                endpoint: "admin/tasks/sink-pull-replication",
                body: serde_json::json!({ "PullReplicationAsSink": sink }),
            },
        }
    }
}
