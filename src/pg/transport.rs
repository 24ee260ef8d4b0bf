//! The channel a connection runs over and the out-of-band cancel path.
//!
//! Dialing, TLS and authentication happen before a socket reaches
//! [`PgConnection::from_socket`](super::connection::PgConnection::from_socket);
//! the executor only needs an authenticated, ordered byte stream.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::PgResult;
use super::protocol::{CancelRequestMessage, FrontendMessage};

/// An authenticated duplex stream to the backend.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Identifies a backend session to the cancel endpoint (BackendKeyData).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

pub type CancelFuture<'a> = Pin<Box<dyn Future<Output = PgResult<()>> + Send + 'a>>;

/// Delivers a cancel request on a channel separate from the connection.
///
/// Resolves once the request has been handed to the server; whether it
/// interrupted anything shows up on the main channel.
pub trait CancelRequester: Send + Sync + fmt::Debug {
    fn cancel(&self, key: BackendKey) -> CancelFuture<'_>;
}

/// Sends the 16-byte CancelRequest packet over a fresh TCP connection.
#[derive(Debug, Clone)]
pub struct TcpCancelRequester {
    addr: String,
}

impl TcpCancelRequester {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }
}

impl CancelRequester for TcpCancelRequester {
    fn cancel(&self, key: BackendKey) -> CancelFuture<'_> {
        Box::pin(async move {
            let mut stream = TcpStream::connect(&self.addr).await?;
            let mut buf = BytesMut::with_capacity(16);
            CancelRequestMessage {
                process_id: key.process_id,
                secret_key: key.secret_key,
            }
            .encode(&mut buf);
            stream.write_all(&buf).await?;
            stream.flush().await?;

            // The server closes the socket once the signal is delivered
            let mut sink = [0u8; 16];
            while stream.read(&mut sink).await? > 0 {}
            debug!(pid = key.process_id, "cancel request delivered");
            Ok(())
        })
    }
}
