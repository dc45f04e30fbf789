//! Connection output pipeline
//!
//! Every connection owns a bounded outbound queue. Anything that wants to
//! reach the client (SUBACK replies, fan-out of PUBLISH packets) enqueues
//! through a [`ClientHandle`]; a single writer task drains the queue,
//! encodes each packet and writes it to the socket in queue order.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use super::ConnectionError;
use crate::codec::Encoder;
use crate::protocol::Packet;

/// Error when sending to a connection's output queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The output pipeline has stopped
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "output queue closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Cloneable handle to one connection's output queue
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    addr: SocketAddr,
    queue: mpsc::Sender<Packet>,
}

impl ClientHandle {
    pub fn new(id: u64, addr: SocketAddr, queue: mpsc::Sender<Packet>) -> Self {
        Self { id, addr, queue }
    }

    /// Broker-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Enqueue a packet, waiting for room when the queue is full
    pub async fn send(&self, packet: Packet) -> Result<(), SendError> {
        self.queue.send(packet).await.map_err(|_| SendError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

/// Writer task state: owns the write half and the receiving end of the queue
pub struct OutputPipeline<W> {
    writer: W,
    addr: SocketAddr,
    queue: mpsc::Receiver<Packet>,
    encoder: Encoder,
    write_buf: BytesMut,
}

impl<W> OutputPipeline<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, addr: SocketAddr, queue: mpsc::Receiver<Packet>) -> Self {
        Self {
            writer,
            addr,
            queue,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Drain the queue until a write fails, every sender is gone, the
    /// sibling input loop reports termination, or the broker shuts down.
    ///
    /// Queued packets take priority over the stop signals, so replies
    /// enqueued before the input side stopped are still written.
    pub async fn run(
        mut self,
        mut input_done: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let result = loop {
            tokio::select! {
                biased;

                packet = self.queue.recv() => {
                    match packet {
                        Some(packet) => {
                            if let Err(e) = self.write_packet(&packet).await {
                                break Err(e);
                            }
                        }
                        None => {
                            debug!("Output queue for {} closed", self.addr);
                            break Ok(());
                        }
                    }
                }
                _ = input_done.changed() => {
                    debug!("Input side of {} finished, stopping writer", self.addr);
                    break Ok(());
                }
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Writer for {} shutting down", self.addr);
                            break Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        };

        // Refuse further enqueues so fan-out to this connection fails fast
        self.queue.close();
        let _ = self.writer.shutdown().await;
        result
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        debug!("Sent {} packet to {}", packet.packet_type(), self.addr);
        Ok(())
    }
}
