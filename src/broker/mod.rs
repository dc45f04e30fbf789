//! MQTT Broker Core
//!
//! Accepts TCP connections and runs two tasks per connection: an input
//! pipeline that decodes and processes inbound packets, and an output
//! pipeline that drains the connection's outbound queue onto the socket.
//! The broker itself can publish to subscribers and receive the messages
//! clients publish.

mod connection;
mod processor;
mod writer;

pub use connection::{ConnectionError, InputPipeline};
pub use processor::PacketProcessor;
pub use writer::{ClientHandle, OutputPipeline, SendError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, MAX_REMAINING_LENGTH};
use crate::protocol::{Flags, Packet, ProtocolError, PublishedMessage, QoS, Severity};
use crate::topic::SubscriptionRegistry;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum remaining length accepted from clients
    pub max_packet_size: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_queue_capacity: usize,
    /// Capacity of the queue behind `Broker::receive`
    pub inbox_capacity: usize,
    /// Remove a connection's subscriptions when its input loop ends
    pub prune_on_disconnect: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_packet_size: MAX_REMAINING_LENGTH,
            outbound_queue_capacity: 1000,
            inbox_capacity: 10_000,
            prune_on_disconnect: false,
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    processor: Arc<PacketProcessor>,
    /// Client publishes awaiting `receive`
    inbox: Mutex<mpsc::Receiver<PublishedMessage>>,
    /// Live connections (connection id -> peer address)
    connections: Arc<DashMap<u64, SocketAddr>>,
    next_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let registry = Arc::new(SubscriptionRegistry::new());

        Self {
            config,
            processor: Arc::new(PacketProcessor::new(registry, inbox_tx)),
            inbox: Mutex::new(inbox_rx),
            connections: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address and run the accept loop
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("New TCP connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            info!("Accept loop stopped");
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    /// Spawn the input and output pipelines of a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ClientHandle::new(id, addr, queue_tx);

        self.connections.insert(id, addr);

        let output = OutputPipeline::new(writer, addr, queue_rx);
        let output_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = output.run(done_rx, output_shutdown).await {
                debug!("Output pipeline for {} stopped: {}", addr, e);
            }
        });

        let decoder = Decoder::new().with_max_packet_size(self.config.max_packet_size);
        debug!(
            "Connection {} from {} accepts packets up to {} bytes",
            id,
            addr,
            decoder.max_packet_size()
        );
        let input = InputPipeline::new(reader, handle, self.processor.clone(), decoder);
        let input_shutdown = self.shutdown.subscribe();
        let connections = self.connections.clone();
        let processor = self.processor.clone();
        let prune = self.config.prune_on_disconnect;

        tokio::spawn(async move {
            match input.run(input_shutdown).await {
                Ok(()) => debug!("Connection {} closed", addr),
                Err(e) => match e.severity() {
                    Severity::Critical => {
                        error!("Critical error on connection {}: {}", addr, e);
                        std::process::exit(1);
                    }
                    Severity::Error => {
                        warn!("Closing connection {}: {}", addr, e);
                    }
                    severity @ (Severity::Warning | Severity::Info) => {
                        debug!("Connection {} ended ({}): {}", addr, severity, e);
                    }
                },
            }

            let _ = done_tx.send(true);
            connections.remove(&id);

            if prune {
                let removed = processor.registry().remove_where(|h| h.id() == id);
                debug!("Pruned {} subscriptions of {}", removed, addr);
            }
        });
    }

    /// Publish a message to every connection subscribed at `(topic, QoS 0)`.
    ///
    /// `qos` only selects the flag bits of the outbound packet; `retain`
    /// sets the RETAIN bit but the message is not stored.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        let qos = QoS::from_u8(qos).ok_or(ProtocolError::InvalidQoS(qos))?;
        let packet = Packet::publish(Flags::publish(qos, retain), topic, payload)?;
        let delivered = self.processor.fan_out(topic, packet).await;
        debug!("Server PUBLISH on {} enqueued to {} subscribers", topic, delivered);
        Ok(())
    }

    /// Wait for the next message published by a client.
    ///
    /// Never returns `None` while the broker exists: the broker's own
    /// packet processor keeps the sending side of the inbox open.
    pub async fn receive(&self) -> Option<PublishedMessage> {
        self.inbox.lock().await.recv().await
    }

    /// Stop the accept loop and every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry<ClientHandle>> {
        self.processor.registry().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
