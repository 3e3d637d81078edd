//! Wire DTOs for the subscription TCP protocol.
//!
//! The server speaks PascalCase; serde renames normalize every envelope key
//! to the crate's canonical snake_case on ingress and back on egress.
//! Document payloads themselves pass through untouched; only the
//! [`KeyProfile`] decides how item metadata is located inside them.

use serde::{Deserialize, Serialize};

/// Protocol version this client offers during the handshake.
pub const SUBSCRIPTION_TCP_VERSION: i32 = 53;

/// Sentinel version in a `TcpVersionMismatch` response meaning the server
/// cannot talk to this client at all.
pub const OUT_OF_RANGE_STATUS: i32 = -2;

/// First client frame on a fresh connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpConnectionHeader {
    pub operation: String,
    pub database_name: String,
    pub operation_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_node_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_url: Option<String>,
}

impl TcpConnectionHeader {
    /// Header for a subscription connection at the given version.
    pub fn subscription(database: &str, version: i32) -> Self {
        Self {
            operation: "Subscription".to_string(),
            database_name: database.to_string(),
            operation_version: version,
            authorize_info: None,
            destination_node_tag: None,
            destination_url: None,
        }
    }
}

/// Server verdict on the connection header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HeaderResponseStatus {
    Ok,
    AuthorizationFailed,
    TcpVersionMismatch,
}

/// Server reply to [`TcpConnectionHeader`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpConnectionHeaderResponse {
    pub status: HeaderResponseStatus,
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Connection-level status reported by the server once the subscription
/// itself is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConnectionStatus {
    Accepted,
    InUse,
    Closed,
    Invalid,
    NotFound,
    Redirect,
    ConcurrencyReconnect,
}

/// Auxiliary data attached to a `ConnectionStatus` frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusData {
    /// On `Redirect`, the cluster tag of the node that owns the subscription.
    #[serde(default)]
    pub redirected_tag: Option<String>,
}

/// One frame of the server → client stream, discriminated by its `Type` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum ServerMessage {
    ConnectionStatus {
        #[serde(rename = "Status")]
        status: ConnectionStatus,
        #[serde(rename = "Message", default)]
        message: Option<String>,
        #[serde(rename = "Exception", default)]
        exception: Option<String>,
        #[serde(rename = "Data", default)]
        data: Option<StatusData>,
    },
    Data {
        #[serde(rename = "Data")]
        payload: serde_json::Value,
    },
    EndOfBatch,
    Confirm,
    Error {
        #[serde(rename = "Exception")]
        exception: String,
        #[serde(rename = "Message", default)]
        message: Option<String>,
    },
}

/// Acknowledgement of a fully processed batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcknowledgeMessage {
    pub change_vector: String,
    #[serde(rename = "Type")]
    pub kind: &'static str,
}

impl AcknowledgeMessage {
    pub fn new(change_vector: impl Into<String>) -> Self {
        Self {
            change_vector: change_vector.into(),
            kind: "Acknowledge",
        }
    }
}

/// Orderly teardown notice, sent on version mismatch or clean dispose.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DropMessage {
    pub operation: &'static str,
    pub database_name: String,
    pub operation_version: i32,
    pub info: String,
}

impl DropMessage {
    pub fn new(database: &str, operation_version: i32, info: impl Into<String>) -> Self {
        Self {
            operation: "Drop",
            database_name: database.to_string(),
            operation_version,
            info: info.into(),
        }
    }
}

/// Compiled payload schema selector, fixed once per worker.
///
/// Decides where item metadata lives inside a `Data` payload and which
/// materialization accessors a batch item supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProfile {
    /// Payload is the document envelope itself.
    Documents,
    /// Payload is a `{Current, Previous}` revision pair.
    Revisions,
}

impl KeyProfile {
    pub fn for_revisions(with_revisions: bool) -> Self {
        if with_revisions {
            Self::Revisions
        } else {
            Self::Documents
        }
    }

    /// The envelope that carries this payload's `@metadata` object.
    pub fn metadata_root<'a>(&self, payload: &'a serde_json::Value) -> &'a serde_json::Value {
        match self {
            Self::Documents => payload,
            Self::Revisions => payload.get("Current").unwrap_or(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_message_connection_status() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "Type": "ConnectionStatus",
            "Status": "Accepted"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ServerMessage::ConnectionStatus {
                status: ConnectionStatus::Accepted,
                ..
            }
        ));
    }

    #[test]
    fn test_server_message_redirect_carries_tag() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "Type": "ConnectionStatus",
            "Status": "Redirect",
            "Message": "subscription moved",
            "Data": { "RedirectedTag": "B" }
        }))
        .unwrap();
        match msg {
            ServerMessage::ConnectionStatus { status, data, .. } => {
                assert_eq!(status, ConnectionStatus::Redirect);
                assert_eq!(data.unwrap().redirected_tag.as_deref(), Some("B"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_server_message_data_and_terminators() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "Type": "Data",
            "Data": { "name": "Arava", "@metadata": { "@id": "dogs/1" } }
        }))
        .unwrap();
        match msg {
            ServerMessage::Data { payload } => {
                assert_eq!(payload["name"], "Arava");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let end: ServerMessage = serde_json::from_value(json!({ "Type": "EndOfBatch" })).unwrap();
        assert!(matches!(end, ServerMessage::EndOfBatch));

        let confirm: ServerMessage = serde_json::from_value(json!({ "Type": "Confirm" })).unwrap();
        assert!(matches!(confirm, ServerMessage::Confirm));
    }

    #[test]
    fn test_server_message_error() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "Type": "Error",
            "Exception": "SubscriptionClosedException",
            "Message": "closed by admin"
        }))
        .unwrap();
        match msg {
            ServerMessage::Error { exception, message } => {
                assert_eq!(exception, "SubscriptionClosedException");
                assert_eq!(message.as_deref(), Some("closed by admin"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_type_is_an_error() {
        let result: Result<ServerMessage, _> =
            serde_json::from_value(json!({ "Type": "Telemetry" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_header_wire_shape() {
        let header = TcpConnectionHeader::subscription("northwind", SUBSCRIPTION_TCP_VERSION);
        let value = serde_json::to_value(&header).unwrap();

        assert_eq!(value["Operation"], "Subscription");
        assert_eq!(value["DatabaseName"], "northwind");
        assert_eq!(value["OperationVersion"], SUBSCRIPTION_TCP_VERSION);
        assert!(value.get("AuthorizeInfo").is_none());
        assert!(value.get("DestinationNodeTag").is_none());
    }

    #[test]
    fn test_acknowledge_wire_shape() {
        let ack = AcknowledgeMessage::new("A:7-abc");
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["ChangeVector"], "A:7-abc");
        assert_eq!(value["Type"], "Acknowledge");
    }

    #[test]
    fn test_drop_wire_shape() {
        let drop_msg = DropMessage::new("northwind", 53, "version out of range");
        let value = serde_json::to_value(&drop_msg).unwrap();
        assert_eq!(value["Operation"], "Drop");
        assert_eq!(value["DatabaseName"], "northwind");
        assert_eq!(value["OperationVersion"], 53);
        assert_eq!(value["Info"], "version out of range");
    }

    #[test]
    fn test_key_profile_metadata_root() {
        let doc = json!({ "name": "Arava", "@metadata": { "@id": "dogs/1" } });
        assert_eq!(
            KeyProfile::Documents.metadata_root(&doc)["@metadata"]["@id"],
            "dogs/1"
        );

        let revision = json!({
            "Current": { "name": "Arava", "@metadata": { "@id": "dogs/1" } },
            "Previous": null
        });
        assert_eq!(
            KeyProfile::Revisions.metadata_root(&revision)["@metadata"]["@id"],
            "dogs/1"
        );
    }
}
