//! Transport - TCP and TLS connections to a database node.
//!
//! The TCP info endpoint hands out URLs whose scheme picks the transport:
//! `tcp` (or `http`) for a plain socket, `tcp+tls` (or `https`) for TLS.
//! TLS configuration is the caller's business: a prebuilt
//! `rustls::ClientConfig` is accepted and never constructed here, so client
//! certificates, custom roots and verifier policy all stay with the caller.
//!
//! A transport is never reused: every reconnect iteration opens a fresh one.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::{Result, SubscriptionError};

/// A connected stream to a database node, plain or TLS.
pub enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Scheme, host and port picked out of a TCP info URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    secured: bool,
    host: String,
    port: u16,
}

fn parse_url(url: &str) -> Result<Endpoint> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        SubscriptionError::InvalidOperation(format!("malformed server url: {url:?}"))
    })?;

    let secured = match scheme {
        "tcp" | "http" => false,
        "tcp+tls" | "https" => true,
        other => {
            return Err(SubscriptionError::InvalidOperation(format!(
                "unsupported url scheme {other:?} in {url:?}"
            )));
        }
    };

    // Strip any path; the authority is all that matters here.
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
        SubscriptionError::InvalidOperation(format!("server url has no port: {url:?}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        SubscriptionError::InvalidOperation(format!("invalid port in server url: {url:?}"))
    })?;
    if host.is_empty() {
        return Err(SubscriptionError::InvalidOperation(format!(
            "server url has no host: {url:?}"
        )));
    }

    Ok(Endpoint {
        secured,
        host: host.to_string(),
        port,
    })
}

/// Open a connection to the node at `url`.
///
/// `tls` must be present when the scheme requires TLS; it is ignored for
/// plain schemes.
pub async fn connect(url: &str, tls: Option<Arc<ClientConfig>>) -> Result<ServerStream> {
    let endpoint = parse_url(url)?;
    let config = match (endpoint.secured, tls) {
        (false, _) => None,
        (true, Some(config)) => Some(config),
        (true, None) => {
            return Err(SubscriptionError::InvalidOperation(format!(
                "url {url:?} requires TLS but no client TLS configuration was provided"
            )));
        }
    };

    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    let Some(config) = config else {
        tracing::debug!(url, "connected (plain)");
        return Ok(ServerStream::Plain(tcp));
    };
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|_| {
        SubscriptionError::InvalidOperation(format!(
            "host {:?} is not a valid TLS server name",
            endpoint.host
        ))
    })?;
    let stream = connector.connect(server_name, tcp).await?;
    tracing::debug!(url, "connected (tls)");
    Ok(ServerStream::Tls(Box::new(stream)))
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
