//! Error types for docwire-client.
//!
//! One public error enum covers every failure the subscription worker can
//! produce. The reconnect loop keys its policy off [`SubscriptionError::is_fatal`]:
//! fatal errors cancel processing and surface through `error` listeners,
//! everything else is retried after the configured delay.

use thiserror::Error;

/// Boxed error passed by a batch listener into its completion callback.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for all subscription operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// I/O error while connecting, reading or writing the TCP stream.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The server closed the stream mid-subscription.
    #[error("subscription stream ended unexpectedly")]
    ConnectionTerminated,

    /// Malformed JSON on the wire.
    #[error("JSON error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Frame that violates the subscription protocol (unknown type,
    /// status in the wrong state, oversized message).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The subscription is owned by a different cluster node; the server
    /// may name the node to redirect to.
    #[error("subscription does not belong to this node: {message}")]
    DoesNotBelongToNode {
        message: String,
        /// Cluster tag of the node the server prefers, when known.
        appropriate_node: Option<String>,
    },

    /// Concurrent change-vector update on the server; reconnect resolves it.
    #[error("change vector concurrency conflict: {0}")]
    ChangeVectorConcurrency(String),

    /// Another client holds the subscription.
    #[error("subscription is in use by another client: {0}")]
    InUse(String),

    /// No subscription with the requested name exists.
    #[error("subscription does not exist: {0}")]
    DoesNotExist(String),

    /// The server closed the subscription.
    #[error("subscription was closed: {0}")]
    Closed(String),

    /// The subscription cannot be used in its current state. Also raised
    /// locally when the erroneous window is exceeded.
    #[error("subscription is in an invalid state: {0}")]
    InvalidState(String),

    /// The target database does not exist.
    #[error("database does not exist: {0}")]
    DatabaseDoesNotExist(String),

    /// The server rejected the connection header credentials.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// No cluster node could be reached.
    #[error("all topology nodes are unreachable: {0}")]
    AllTopologyNodesDown(String),

    /// A batch listener completed with an error and
    /// `ignore_subscriber_errors` is off.
    #[error("subscriber error: {0}")]
    Subscriber(#[source] SubscriberError),

    /// Client-side misuse or an unrecoverable negotiation outcome.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl SubscriptionError {
    /// Whether the reconnect loop must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InUse(_)
                | Self::DoesNotExist(_)
                | Self::Closed(_)
                | Self::InvalidState(_)
                | Self::DatabaseDoesNotExist(_)
                | Self::Authorization(_)
                | Self::AllTopologyNodesDown(_)
                | Self::Subscriber(_)
                | Self::InvalidOperation(_)
        )
    }

    /// Map a server-side exception type name (as carried in `Error` and
    /// `ConnectionStatus` frames) onto the client taxonomy.
    ///
    /// Unknown exception types are treated as unrecoverable: the server
    /// refused the subscription for a reason this client version cannot
    /// classify, so retrying would loop forever.
    pub fn from_server_exception(type_name: &str, message: &str) -> Self {
        let message = message.to_string();
        if type_name.contains("SubscriptionDoesNotBelongToNodeException") {
            Self::DoesNotBelongToNode {
                message,
                appropriate_node: None,
            }
        } else if type_name.contains("SubscriptionChangeVectorUpdateConcurrencyException") {
            Self::ChangeVectorConcurrency(message)
        } else if type_name.contains("SubscriptionInUseException") {
            Self::InUse(message)
        } else if type_name.contains("SubscriptionDoesNotExistException") {
            Self::DoesNotExist(message)
        } else if type_name.contains("SubscriptionClosedException") {
            Self::Closed(message)
        } else if type_name.contains("SubscriptionInvalidStateException") {
            Self::InvalidState(message)
        } else if type_name.contains("DatabaseDoesNotExistException") {
            Self::DatabaseDoesNotExist(message)
        } else if type_name.contains("AuthorizationException") {
            Self::Authorization(message)
        } else if type_name.contains("AllTopologyNodesDownException") {
            Self::AllTopologyNodesDown(message)
        } else {
            Self::InvalidOperation(format!("subscription failed: {type_name}: {message}"))
        }
    }
}

/// Result type alias using SubscriptionError.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
