//! Connection input pipeline
//!
//! Reads the socket into a buffer, cuts complete frames out of it with the
//! [`Decoder`] and hands each packet to the [`PacketProcessor`] strictly in
//! arrival order. A partial frame simply waits for more bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ClientHandle, PacketProcessor};
use crate::codec::Decoder;
use crate::protocol::{DecodeError, ProtocolError, Severity};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Shutdown,
}

impl ConnectionError {
    /// I/O failures and shutdown are ordinary connection termination and
    /// rank as `Info`; protocol errors carry their own severity.
    pub fn severity(&self) -> Severity {
        match self {
            ConnectionError::Protocol(e) => e.severity(),
            ConnectionError::Io(_) | ConnectionError::Shutdown => Severity::Info,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

/// Reader task state for one connection
pub struct InputPipeline<R> {
    reader: R,
    addr: SocketAddr,
    /// Output side of the same connection, for direct replies
    handle: ClientHandle,
    processor: Arc<PacketProcessor>,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl<R> InputPipeline<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        handle: ClientHandle,
        processor: Arc<PacketProcessor>,
        decoder: Decoder,
    ) -> Self {
        Self {
            reader,
            addr: handle.addr(),
            handle,
            processor,
            decoder,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Run until the peer closes the stream, a read fails, a packet is
    /// rejected, or the broker shuts down.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            // Dispatch every complete frame already buffered
            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                debug!("Accepted {} packet from {}", packet.packet_type(), self.addr);
                self.processor.dispatch(packet, &self.handle).await?;
            }

            tokio::select! {
                result = self.reader.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            if !self.read_buf.is_empty() {
                                return Err(DecodeError::MalformedPacket(
                                    "connection closed mid-frame",
                                )
                                .into());
                            }
                            debug!("Connection closed from {}", self.addr);
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Read error from {}: {}", self.addr, e);
                            return Err(e.into());
                        }
                    }
                }
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            return Err(ConnectionError::Shutdown);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        }
    }
}
