//! Secure channel collaborator.
//!
//! The engine never performs a handshake itself. It hands a connected TCP
//! stream to a [`SecureChannel`] and gets back a stream with the same
//! read/write contract; any handshake failure is reported as
//! [`Error::SecureChannel`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::BoxFuture;

/// Any bidirectional byte stream the framer can drive.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Identity of the two ends of the channel being wrapped.
#[derive(Debug, Clone)]
pub struct ChannelIdentity {
    pub role: Role,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Name the client expects the server certificate to carry.
    pub server_name: Option<String>,
}

/// Accepts or rejects the peer's certificate chain (DER, leaf first).
pub type CertificateValidator = Arc<dyn Fn(&[Vec<u8>], &ChannelIdentity) -> bool + Send + Sync>;

pub trait SecureChannel: Send + Sync {
    fn wrap(
        &self,
        stream: TcpStream,
        identity: ChannelIdentity,
        validator: Option<CertificateValidator>,
    ) -> BoxFuture<'static, Result<BoxedStream>>;
}

/// Passes the TCP stream through untouched, for deployments where TLS is
/// terminated in front of the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainChannel;

impl SecureChannel for PlainChannel {
    fn wrap(
        &self,
        stream: TcpStream,
        identity: ChannelIdentity,
        _validator: Option<CertificateValidator>,
    ) -> BoxFuture<'static, Result<BoxedStream>> {
        Box::pin(async move {
            tracing::trace!(remote = %identity.remote, role = ?identity.role, "Plain channel");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Wraps `stream` or, with no channel configured, boxes it as-is.
pub async fn wrap_stream(
    channel: Option<&Arc<dyn SecureChannel>>,
    stream: TcpStream,
    identity: ChannelIdentity,
    validator: Option<CertificateValidator>,
) -> Result<BoxedStream> {
    match channel {
        Some(channel) => channel
            .wrap(stream, identity, validator)
            .await
            .map_err(|e| match e {
                Error::SecureChannel(_) => e,
                other => Error::SecureChannel(other.to_string()),
            }),
        None => Ok(Box::new(stream)),
    }
}
