//! Protocol module - wire DTOs, the streaming JSON splitter, and the
//! connection-header negotiation.
//!
//! Both directions of the subscription TCP protocol are streams of
//! back-to-back JSON objects with no framing beyond JSON syntax itself:
//! - server → client: [`ServerMessage`] frames split by [`JsonMessageStream`]
//! - client → server: the connection header, the options payload, and
//!   acknowledge/drop frames

mod json_stream;
mod messages;
mod negotiate;

pub use json_stream::{JsonMessageStream, MAX_MESSAGE_SIZE};
pub use messages::{
    AcknowledgeMessage, ConnectionStatus, DropMessage, HeaderResponseStatus, KeyProfile,
    ServerMessage, StatusData, TcpConnectionHeader, TcpConnectionHeaderResponse,
    OUT_OF_RANGE_STATUS, SUBSCRIPTION_TCP_VERSION,
};
pub use negotiate::{negotiate, NegotiationParams, SupportedFeatures};

pub(crate) use negotiate::write_json;
