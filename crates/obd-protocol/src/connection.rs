//! Exclusively-owned duplex byte stream to an adapter

use crate::error::ObdError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Any async byte stream an adapter can sit behind
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// An open channel to one adapter.
///
/// Not `Clone`: one owner at a time. The transport is released by
/// [`Connection::close`] or on drop, whichever comes first.
pub struct Connection {
    stream: Option<Box<dyn DuplexStream>>,
    peer: String,
}

impl Connection {
    /// Wrap a connected stream. `peer` is used in log lines only.
    pub fn new(stream: impl DuplexStream + 'static, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        debug!("Connection to {} opened", peer);
        Self {
            stream: Some(Box::new(stream)),
            peer,
        }
    }

    /// Peer description given at construction
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the transport is still held
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Shut down and release the transport.
    ///
    /// Returns `true` only for the call that actually released it.
    pub async fn close(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    warn!("Error shutting down connection to {}: {}", self.peer, e);
                }
                info!("Connection to {} closed", self.peer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Result<&mut (dyn DuplexStream + 'static), ObdError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.as_mut()),
            None => Err(ObdError::ConnectionClosed),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
