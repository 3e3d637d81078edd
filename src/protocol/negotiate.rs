//! Connection-header exchange and protocol version negotiation.
//!
//! A fresh connection carries, in order: the client's `TcpConnectionHeader`,
//! the server's header response, and (once a version is agreed) the
//! subscription options payload. Everything here runs before the first
//! subscription frame; failures map straight onto the error taxonomy so the
//! reconnect loop can classify them.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SubscriptionError};
use crate::options::SubscriptionOptions;
use crate::protocol::json_stream::JsonMessageStream;
use crate::protocol::messages::{
    DropMessage, HeaderResponseStatus, TcpConnectionHeader, TcpConnectionHeaderResponse,
    OUT_OF_RANGE_STATUS, SUBSCRIPTION_TCP_VERSION,
};

/// What the handshake agreed on; kept on the worker for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFeatures {
    /// Negotiated subscription protocol version; always positive.
    pub protocol_version: i32,
}

/// Inputs to the handshake, borrowed from the worker.
#[derive(Debug)]
pub struct NegotiationParams<'a> {
    pub database: &'a str,
    pub options: &'a SubscriptionOptions,
    pub destination_node_tag: Option<&'a str>,
    pub destination_url: Option<&'a str>,
    pub authorize_info: Option<serde_json::Value>,
}

/// Serialize one value as a bare JSON object and flush it.
///
/// The wire has no delimiters: the object's own syntax is the frame.
pub(crate) async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Run the header exchange on a freshly connected stream.
///
/// On success the subscription options have been sent and the connection is
/// ready for server subscription frames.
pub async fn negotiate<R, W>(
    reader: &mut JsonMessageStream<R>,
    writer: &mut W,
    params: NegotiationParams<'_>,
) -> Result<SupportedFeatures>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut header = TcpConnectionHeader::subscription(params.database, SUBSCRIPTION_TCP_VERSION);
    header.destination_node_tag = params.destination_node_tag.map(str::to_string);
    header.destination_url = params.destination_url.map(str::to_string);
    header.authorize_info = params.authorize_info;

    write_json(writer, &header).await?;

    let response: TcpConnectionHeaderResponse = reader.read().await?;
    let version = match response.status {
        HeaderResponseStatus::Ok => response.version.unwrap_or(SUBSCRIPTION_TCP_VERSION),
        HeaderResponseStatus::AuthorizationFailed => {
            return Err(SubscriptionError::Authorization(
                response.message.unwrap_or_default(),
            ));
        }
        HeaderResponseStatus::TcpVersionMismatch => match response.version {
            Some(OUT_OF_RANGE_STATUS) => {
                // The server cannot speak to us at all; tell it we are
                // leaving before failing.
                let drop_msg = DropMessage::new(
                    params.database,
                    SUBSCRIPTION_TCP_VERSION,
                    format!(
                        "couldn't agree on subscription tcp version, ours: {SUBSCRIPTION_TCP_VERSION}"
                    ),
                );
                write_json(writer, &drop_msg).await?;
                return Err(SubscriptionError::InvalidOperation(format!(
                    "cannot connect to server: its subscription protocol version is out of range for client version {SUBSCRIPTION_TCP_VERSION}"
                )));
            }
            Some(server_version) => {
                tracing::debug!(
                    client_version = SUBSCRIPTION_TCP_VERSION,
                    server_version,
                    "downgrading to the server's subscription protocol version"
                );
                server_version
            }
            None => {
                return Err(SubscriptionError::ProtocolViolation(
                    "TcpVersionMismatch response carried no version".to_string(),
                ));
            }
        },
    };

    if version <= 0 {
        return Err(SubscriptionError::InvalidOperation(format!(
            "negotiation produced an unusable protocol version: {version}"
        )));
    }

    write_json(writer, params.options).await?;
    tracing::debug!(
        database = params.database,
        subscription = %params.options.subscription_name,
        version,
        "subscription connection negotiated"
    );

    Ok(SupportedFeatures {
        protocol_version: version,
    })
}
